//! Contexts bind logical operations to a data instance, and for versioned
//! data, to a version node in the DAG. They are the only place that builds
//! physical keys, so the engine below stays version-blind.

use std::sync::Arc;

use tracing::trace;

use crate::dag::VersionDag;
use crate::engine::{KeyValue, KvEngine};
use crate::error::{Result, StrataError};
use crate::model::{InstanceId, VersionId};
use crate::storage::key::{self, KeyClass};
use crate::storage::resolve::{ReadResolver, Visible};

pub trait Context {
    fn physical_key(&self, type_key: &[u8]) -> Vec<u8>;

    /// Physical bounds covering every stored row for type-keys in
    /// `[begin, end]`, including all versions and tombstones for versioned
    /// contexts.
    fn range_bounds(&self, begin: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>);

    fn is_versioned(&self) -> bool;

    fn versioned(&self) -> Result<&VersionedContext> {
        Err(StrataError::ContextMismatch(
            "versioned operation on unversioned context",
        ))
    }
}

/// Unversioned context for metadata and raw index scans. Keys carry version
/// zero and no tombstone; reads and writes go straight to the engine.
#[derive(Clone, Debug)]
pub struct MetadataContext {
    instance: InstanceId,
    class: KeyClass,
}

impl MetadataContext {
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            class: KeyClass::Metadata,
        }
    }

    /// Raw (version-blind) view of the label-index key space, for offline
    /// tooling that needs to see every version of every index entry.
    pub fn label_index(instance: InstanceId) -> Self {
        Self {
            instance,
            class: KeyClass::LabelIndex,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn get(&self, engine: &dyn KvEngine, type_key: &[u8]) -> Result<Option<Vec<u8>>> {
        engine.get(&self.physical_key(type_key))
    }

    pub fn put(&self, engine: &dyn KvEngine, type_key: &[u8], value: &[u8]) -> Result<()> {
        engine.put(&self.physical_key(type_key), value)
    }

    pub fn delete(&self, engine: &dyn KvEngine, type_key: &[u8]) -> Result<()> {
        engine.delete(&self.physical_key(type_key))
    }
}

impl Context for MetadataContext {
    fn physical_key(&self, type_key: &[u8]) -> Vec<u8> {
        key::encode(self.class, self.instance, type_key, VersionId(0), false)
    }

    fn range_bounds(&self, begin: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>) {
        if self.class == KeyClass::Metadata {
            (self.physical_key(begin), self.physical_key(end))
        } else {
            (
                key::min_version_key(self.class, self.instance, begin),
                key::max_version_key(self.class, self.instance, end),
            )
        }
    }

    fn is_versioned(&self) -> bool {
        false
    }
}

/// Versioned context: reads resolve through the bound version's ancestor
/// path; writes land at the bound version and refresh its tombstone state.
#[derive(Clone)]
pub struct VersionedContext {
    instance: InstanceId,
    version: VersionId,
    class: KeyClass,
    dag: Arc<VersionDag>,
}

impl std::fmt::Debug for VersionedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedContext")
            .field("instance", &self.instance)
            .field("version", &self.version)
            .field("class", &self.class)
            .finish()
    }
}

impl VersionedContext {
    pub fn data(instance: InstanceId, version: VersionId, dag: Arc<VersionDag>) -> Self {
        Self {
            instance,
            version,
            class: KeyClass::Data,
            dag,
        }
    }

    pub fn label_index(instance: InstanceId, version: VersionId, dag: Arc<VersionDag>) -> Self {
        Self {
            instance,
            version,
            class: KeyClass::LabelIndex,
            dag,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn dag(&self) -> &Arc<VersionDag> {
        &self.dag
    }

    pub fn tombstone_key(&self, type_key: &[u8]) -> Vec<u8> {
        key::tombstone_key(self.class, self.instance, type_key, self.version)
    }

    pub fn min_version_key(&self, type_key: &[u8]) -> Vec<u8> {
        key::min_version_key(self.class, self.instance, type_key)
    }

    pub fn max_version_key(&self, type_key: &[u8]) -> Vec<u8> {
        key::max_version_key(self.class, self.instance, type_key)
    }

    fn check_writable(&self) -> Result<()> {
        if self.dag.is_locked(self.version)? {
            return Err(StrataError::VersionLocked(self.version));
        }
        Ok(())
    }

    /// Picks the row visible to this context's version out of all stored
    /// versions of one type-key.
    pub fn visible_pick(&self, rows: Vec<KeyValue>) -> Result<Visible> {
        ReadResolver::new(&self.dag, self.version).pick_visible(rows)
    }

    pub fn get(&self, engine: &dyn KvEngine, type_key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_visible(engine, type_key)?.into_value())
    }

    pub fn get_visible(&self, engine: &dyn KvEngine, type_key: &[u8]) -> Result<Visible> {
        let begin = self.min_version_key(type_key);
        let end = self.max_version_key(type_key);
        let rows = engine
            .range(&begin, &end, false)?
            .collect::<Result<Vec<_>>>()?;
        self.visible_pick(rows)
    }

    /// Writes a value at this version. Any tombstone previously written at
    /// this version is cleared in the same atomic batch.
    pub fn put(&self, engine: &dyn KvEngine, type_key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut batch = engine.batch();
        batch.delete(self.tombstone_key(type_key));
        batch.put(self.physical_key(type_key), value.to_vec());
        batch.commit()?;
        trace!(
            instance = self.instance.0,
            version = self.version.0,
            len = value.len(),
            "context.put"
        );
        Ok(())
    }

    /// Deletes a type-key at this version by replacing any value written at
    /// this version with a zero-length tombstone. Ancestor versions keep
    /// their rows; descendants of this version observe the deletion.
    pub fn delete(&self, engine: &dyn KvEngine, type_key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut batch = engine.batch();
        batch.delete(self.physical_key(type_key));
        batch.put(self.tombstone_key(type_key), Vec::new());
        batch.commit()?;
        trace!(
            instance = self.instance.0,
            version = self.version.0,
            "context.delete"
        );
        Ok(())
    }

    /// Range scan resolved to this version: at most one row per type-key,
    /// sorted by type-key.
    pub fn range_visible(
        &self,
        engine: &dyn KvEngine,
        begin: &[u8],
        end: &[u8],
    ) -> Result<Vec<KeyValue>> {
        let (lo, hi) = self.range_bounds(begin, end);
        let rows = engine.range(&lo, &hi, false)?;
        ReadResolver::new(&self.dag, self.version).resolve_range(rows)
    }
}

impl Context for VersionedContext {
    fn physical_key(&self, type_key: &[u8]) -> Vec<u8> {
        key::encode(self.class, self.instance, type_key, self.version, false)
    }

    fn range_bounds(&self, begin: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (self.min_version_key(begin), self.max_version_key(end))
    }

    fn is_versioned(&self) -> bool {
        true
    }

    fn versioned(&self) -> Result<&VersionedContext> {
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    fn setup() -> (MemoryEngine, Arc<VersionDag>, VersionId, VersionId) {
        let engine = MemoryEngine::new();
        let dag = Arc::new(VersionDag::new());
        let root = dag.new_root(&engine).unwrap();
        dag.lock(&engine, root).unwrap();
        let child = dag.new_version(&engine, root).unwrap();
        (engine, dag, root, child)
    }

    #[test]
    fn metadata_context_rejects_versioned_ops() {
        let ctx = MetadataContext::new(InstanceId(7));
        assert!(matches!(
            ctx.versioned(),
            Err(StrataError::ContextMismatch(_))
        ));
    }

    #[test]
    fn put_on_locked_version_fails() {
        let (engine, dag, root, _child) = setup();
        let ctx = VersionedContext::data(InstanceId(7), root, dag);
        assert!(matches!(
            ctx.put(&engine, b"\xAA", b"alpha"),
            Err(StrataError::VersionLocked(_))
        ));
    }

    #[test]
    fn put_clears_tombstone_written_at_same_version() -> Result<()> {
        let (engine, dag, _root, child) = setup();
        let ctx = VersionedContext::data(InstanceId(7), child, dag);
        ctx.delete(&engine, b"\xAA")?;
        assert_eq!(ctx.get(&engine, b"\xAA")?, None);
        ctx.put(&engine, b"\xAA", b"beta")?;
        assert_eq!(ctx.get(&engine, b"\xAA")?, Some(b"beta".to_vec()));
        Ok(())
    }

    #[test]
    fn range_visible_emits_one_row_per_type_key() -> Result<()> {
        let (engine, dag, _root, child) = setup();
        let ctx = VersionedContext::data(InstanceId(7), child, dag);
        ctx.put(&engine, b"\x01", b"one")?;
        ctx.put(&engine, b"\x02", b"two")?;
        ctx.delete(&engine, b"\x02")?;
        ctx.put(&engine, b"\x03", b"three")?;
        let rows = ctx.range_visible(&engine, b"\x00", b"\xFF")?;
        assert_eq!(
            rows,
            vec![
                (b"\x01".to_vec(), b"one".to_vec()),
                (b"\x03".to_vec(), b"three".to_vec()),
            ]
        );
        Ok(())
    }
}
