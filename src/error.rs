use std::io;

use thiserror::Error;

use crate::model::{Label, MutationId, VersionId};

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not found")]
    NotFound,
    #[error("malformed key: {0}")]
    MalformedKey(&'static str),
    #[error("context mismatch: {0}")]
    ContextMismatch(&'static str),
    #[error("version {0} is locked")]
    VersionLocked(VersionId),
    #[error("label {0} has a merge or split in progress")]
    ConflictInProgress(Label),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("operation canceled")]
    Canceled,
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("mutation {id} failed: {source}")]
    Mutation {
        id: MutationId,
        #[source]
        source: Box<StrataError>,
    },
}

impl StrataError {
    /// Tags an error with the mutation id that was active when it occurred.
    pub fn with_mutation(self, id: MutationId) -> StrataError {
        match self {
            StrataError::Mutation { .. } => self,
            other => StrataError::Mutation {
                id,
                source: Box::new(other),
            },
        }
    }

    pub fn mutation_id(&self) -> Option<MutationId> {
        match self {
            StrataError::Mutation { id, .. } => Some(*id),
            _ => None,
        }
    }
}
