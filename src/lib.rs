#![forbid(unsafe_code)]

pub mod block;
pub mod dag;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod model;
pub mod mutate;
pub mod mutlog;
pub mod storage;

pub use crate::block::{BlockCodec, LabelBlock};
pub use crate::db::{Config, DataInstance, Datastore};
pub use crate::engine::{KvBatch, KvEngine, MemoryEngine};
pub use crate::error::{Result, StrataError};
pub use crate::events::{Event, EventBus, SubscriptionId, Topic};
pub use crate::index::{LabelIndexStore, Meta, SortedIzyx};
pub use crate::model::{
    BlockCoord, BlockSize, InstanceId, Label, LabelSet, MutationId, Rle, VersionId, VoxelPoint,
};
pub use crate::mutate::shard::CancelToken;
pub use crate::mutate::{MutationSummary, SplitMode, SplitOutcome};
