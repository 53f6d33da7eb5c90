//! Commit graph of versions.
//!
//! Nodes live in memory behind a read-mostly lock and persist as metadata
//! keys so the graph survives restarts. A locked node is immutable but may
//! parent new children; child creation requires the parent locked.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::engine::KvEngine;
use crate::error::{Result, StrataError};
use crate::model::{InstanceId, VersionId};
use crate::storage::key::{self, KeyClass};

/// Reserved instance id for server-wide metadata keys.
pub const REPO_INSTANCE: InstanceId = InstanceId(0);

const VNODE_TAG: u8 = b'v';
const ANCESTOR_CACHE_CAP: usize = 512;

#[derive(Clone, Debug)]
pub struct VersionNode {
    pub id: VersionId,
    pub uuid: Uuid,
    pub parents: SmallVec<[VersionId; 1]>,
    pub locked: bool,
    pub created_at: u64,
}

impl VersionNode {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 1 + 8 + 1 + 4 * self.parents.len());
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.push(self.locked as u8);
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        buf.push(self.parents.len() as u8);
        for parent in &self.parents {
            buf.extend_from_slice(&parent.0.to_be_bytes());
        }
        buf
    }

    fn decode(id: VersionId, buf: &[u8]) -> Result<Self> {
        if buf.len() < 26 {
            return Err(StrataError::Corruption("version node record truncated"));
        }
        let uuid = Uuid::from_bytes(buf[0..16].try_into().unwrap());
        let locked = match buf[16] {
            0 => false,
            1 => true,
            _ => return Err(StrataError::Corruption("bad version lock byte")),
        };
        let created_at = u64::from_be_bytes(buf[17..25].try_into().unwrap());
        let n = buf[25] as usize;
        if buf.len() != 26 + 4 * n {
            return Err(StrataError::Corruption("version node parent list truncated"));
        }
        let mut parents = SmallVec::new();
        for i in 0..n {
            let off = 26 + 4 * i;
            parents.push(VersionId(u32::from_be_bytes(
                buf[off..off + 4].try_into().unwrap(),
            )));
        }
        Ok(Self {
            id,
            uuid,
            parents,
            locked,
            created_at,
        })
    }
}

struct DagInner {
    nodes: HashMap<VersionId, VersionNode>,
    by_uuid: HashMap<Uuid, VersionId>,
    next_id: u32,
}

pub struct VersionDag {
    inner: RwLock<DagInner>,
    ancestors: Mutex<LruCache<VersionId, Arc<Vec<VersionId>>>>,
}

impl Default for VersionDag {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionDag {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DagInner {
                nodes: HashMap::new(),
                by_uuid: HashMap::new(),
                next_id: 1,
            }),
            ancestors: Mutex::new(LruCache::new(
                NonZeroUsize::new(ANCESTOR_CACHE_CAP).unwrap(),
            )),
        }
    }

    /// Reloads all persisted nodes from the metadata key space.
    pub fn load(engine: &dyn KvEngine) -> Result<Self> {
        let dag = Self::new();
        let begin = vnode_key(VersionId(0));
        let end = vnode_key(VersionId(u32::MAX));
        let mut inner = dag.inner.write();
        for row in engine.range(&begin, &end, false)? {
            let (k, v) = row?;
            let decoded = key::decode(&k)?;
            if decoded.type_key.len() != 5 || decoded.type_key[0] != VNODE_TAG {
                continue;
            }
            let id = VersionId(u32::from_be_bytes(
                decoded.type_key[1..5].try_into().unwrap(),
            ));
            let node = VersionNode::decode(id, &v)?;
            inner.by_uuid.insert(node.uuid, id);
            inner.next_id = inner.next_id.max(id.0.saturating_add(1));
            inner.nodes.insert(id, node);
        }
        drop(inner);
        Ok(dag)
    }

    /// Creates a parentless root node.
    pub fn new_root(&self, engine: &dyn KvEngine) -> Result<VersionId> {
        self.insert_node(engine, SmallVec::new())
    }

    /// Creates a child of `parent`. The parent must already be locked.
    pub fn new_version(&self, engine: &dyn KvEngine, parent: VersionId) -> Result<VersionId> {
        {
            let inner = self.inner.read();
            let node = inner.nodes.get(&parent).ok_or(StrataError::NotFound)?;
            if !node.locked {
                return Err(StrataError::Invalid(
                    "parent version must be locked before branching",
                ));
            }
        }
        self.insert_node(engine, SmallVec::from_slice(&[parent]))
    }

    fn insert_node(
        &self,
        engine: &dyn KvEngine,
        parents: SmallVec<[VersionId; 1]>,
    ) -> Result<VersionId> {
        let mut inner = self.inner.write();
        let id = VersionId(inner.next_id);
        inner.next_id = inner
            .next_id
            .checked_add(1)
            .ok_or(StrataError::Invalid("version id space exhausted"))?;
        let node = VersionNode {
            id,
            uuid: Uuid::new_v4(),
            parents,
            locked: false,
            created_at: unix_now(),
        };
        engine.put(&vnode_key(id), &node.encode())?;
        inner.by_uuid.insert(node.uuid, id);
        inner.nodes.insert(id, node);
        Ok(id)
    }

    /// Marks a version immutable. Idempotent.
    pub fn lock(&self, engine: &dyn KvEngine, v: VersionId) -> Result<()> {
        let mut inner = self.inner.write();
        let node = inner.nodes.get_mut(&v).ok_or(StrataError::NotFound)?;
        if !node.locked {
            node.locked = true;
            let record = node.encode();
            engine.put(&vnode_key(v), &record)?;
        }
        Ok(())
    }

    pub fn is_locked(&self, v: VersionId) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner.nodes.get(&v).ok_or(StrataError::NotFound)?.locked)
    }

    pub fn contains(&self, v: VersionId) -> bool {
        self.inner.read().nodes.contains_key(&v)
    }

    pub fn node(&self, v: VersionId) -> Result<VersionNode> {
        let inner = self.inner.read();
        inner.nodes.get(&v).cloned().ok_or(StrataError::NotFound)
    }

    pub fn uuid_of(&self, v: VersionId) -> Result<Uuid> {
        Ok(self.node(v)?.uuid)
    }

    pub fn version_by_uuid(&self, uuid: Uuid) -> Result<VersionId> {
        let inner = self.inner.read();
        inner.by_uuid.get(&uuid).copied().ok_or(StrataError::NotFound)
    }

    /// Path from `v` to the root following the primary parent:
    /// `[v, parent(v), .., root]`. Paths are immutable once a node exists,
    /// so cached entries never go stale.
    pub fn ancestors(&self, v: VersionId) -> Result<Arc<Vec<VersionId>>> {
        if let Some(path) = self.ancestors.lock().get(&v) {
            return Ok(Arc::clone(path));
        }
        let inner = self.inner.read();
        let mut path = Vec::new();
        let mut current = Some(v);
        while let Some(id) = current {
            if path.len() > inner.nodes.len() {
                return Err(StrataError::Corruption("version graph cycle"));
            }
            let node = inner.nodes.get(&id).ok_or(StrataError::NotFound)?;
            path.push(id);
            current = node.parents.first().copied();
        }
        drop(inner);
        let path = Arc::new(path);
        self.ancestors.lock().put(v, Arc::clone(&path));
        Ok(path)
    }
}

fn vnode_key(v: VersionId) -> Vec<u8> {
    let mut tkey = [0u8; 5];
    tkey[0] = VNODE_TAG;
    tkey[1..5].copy_from_slice(&v.0.to_be_bytes());
    key::encode(
        KeyClass::Metadata,
        REPO_INSTANCE,
        &tkey,
        VersionId(0),
        false,
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    #[test]
    fn root_and_child_chain() -> Result<()> {
        let engine = MemoryEngine::new();
        let dag = VersionDag::new();
        let root = dag.new_root(&engine)?;
        assert!(dag.new_version(&engine, root).is_err());
        dag.lock(&engine, root)?;
        let child = dag.new_version(&engine, root)?;
        let grandchild_err = dag.new_version(&engine, child);
        assert!(grandchild_err.is_err());
        dag.lock(&engine, child)?;
        let grandchild = dag.new_version(&engine, child)?;
        let path = dag.ancestors(grandchild)?;
        assert_eq!(path.as_slice(), &[grandchild, child, root]);
        Ok(())
    }

    #[test]
    fn lock_is_idempotent() -> Result<()> {
        let engine = MemoryEngine::new();
        let dag = VersionDag::new();
        let root = dag.new_root(&engine)?;
        dag.lock(&engine, root)?;
        dag.lock(&engine, root)?;
        assert!(dag.is_locked(root)?);
        Ok(())
    }

    #[test]
    fn persists_and_reloads() -> Result<()> {
        let engine = MemoryEngine::new();
        let (root, child, child_uuid) = {
            let dag = VersionDag::new();
            let root = dag.new_root(&engine)?;
            dag.lock(&engine, root)?;
            let child = dag.new_version(&engine, root)?;
            (root, child, dag.uuid_of(child)?)
        };
        let reloaded = VersionDag::load(&engine)?;
        assert!(reloaded.is_locked(root)?);
        assert!(!reloaded.is_locked(child)?);
        assert_eq!(reloaded.version_by_uuid(child_uuid)?, child);
        assert_eq!(
            reloaded.ancestors(child)?.as_slice(),
            &[child, root]
        );
        let next = {
            reloaded.lock(&engine, child)?;
            reloaded.new_version(&engine, child)?
        };
        assert!(next.0 > child.0);
        Ok(())
    }

    #[test]
    fn missing_version_is_not_found() {
        let dag = VersionDag::new();
        assert!(matches!(
            dag.ancestors(VersionId(42)),
            Err(StrataError::NotFound)
        ));
    }
}
