//! Version-aware read resolution.
//!
//! The engine returns every stored version of a type-key; the resolver walks
//! the reader's ancestor path and keeps the entry nearest to the reader. A
//! tombstone found at an ancestor ends the walk: the cell is deleted and no
//! further ancestor is consulted. A tombstone and a value at the same
//! version resolve to the tombstone, matching stored key order.

use std::collections::HashMap;

use crate::dag::VersionDag;
use crate::engine::KeyValue;
use crate::error::Result;
use crate::model::VersionId;
use crate::storage::key;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Visible {
    Value { version: VersionId, value: Vec<u8> },
    Deleted,
    Absent,
}

impl Visible {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Visible::Value { value, .. } => Some(value),
            Visible::Deleted | Visible::Absent => None,
        }
    }
}

pub struct ReadResolver<'a> {
    dag: &'a VersionDag,
    version: VersionId,
}

impl<'a> ReadResolver<'a> {
    pub fn new(dag: &'a VersionDag, version: VersionId) -> Self {
        Self { dag, version }
    }

    /// Resolves one type-key given all of its stored versions, in any order.
    pub fn pick_visible(&self, rows: Vec<KeyValue>) -> Result<Visible> {
        let mut by_version: HashMap<u32, (bool, Option<Vec<u8>>)> = HashMap::new();
        for (k, v) in rows {
            let version = key::version_of(&k)?;
            let entry = by_version.entry(version.0).or_insert((false, None));
            if key::is_tombstone(&k)? {
                entry.0 = true;
            } else {
                entry.1 = Some(v);
            }
        }
        for ancestor in self.dag.ancestors(self.version)?.iter() {
            if let Some((tombstone, value)) = by_version.remove(&ancestor.0) {
                if tombstone {
                    return Ok(Visible::Deleted);
                }
                if let Some(value) = value {
                    return Ok(Visible::Value {
                        version: *ancestor,
                        value,
                    });
                }
            }
        }
        Ok(Visible::Absent)
    }

    /// Resolves a sorted range scan. Consecutive rows with equal type-key
    /// form one group; each group yields at most one visible row. Output
    /// stays sorted by type-key because input groups arrive in key order.
    pub fn resolve_range<I>(&self, rows: I) -> Result<Vec<KeyValue>>
    where
        I: IntoIterator<Item = Result<KeyValue>>,
    {
        let mut out = Vec::new();
        let mut group_tkey: Option<Vec<u8>> = None;
        let mut group: Vec<KeyValue> = Vec::new();
        for row in rows {
            let (k, v) = row?;
            let tkey = key::type_key_of(&k)?;
            if group_tkey.as_deref() != Some(tkey) {
                if let Some(done) = group_tkey.take() {
                    self.emit_group(done, std::mem::take(&mut group), &mut out)?;
                }
                group_tkey = Some(tkey.to_vec());
            }
            group.push((k, v));
        }
        if let Some(done) = group_tkey {
            self.emit_group(done, group, &mut out)?;
        }
        Ok(out)
    }

    fn emit_group(
        &self,
        tkey: Vec<u8>,
        rows: Vec<KeyValue>,
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        if let Visible::Value { value, .. } = self.pick_visible(rows)? {
            out.push((tkey, value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{KvEngine, MemoryEngine};
    use crate::model::InstanceId;
    use crate::storage::key::KeyClass;

    fn chain(engine: &MemoryEngine, depth: usize) -> (VersionDag, Vec<VersionId>) {
        let dag = VersionDag::new();
        let mut versions = Vec::new();
        let root = dag.new_root(engine).unwrap();
        versions.push(root);
        for _ in 1..depth {
            let parent = *versions.last().unwrap();
            dag.lock(engine, parent).unwrap();
            versions.push(dag.new_version(engine, parent).unwrap());
        }
        (dag, versions)
    }

    fn data_key(version: VersionId, tombstone: bool) -> Vec<u8> {
        key::encode(KeyClass::Data, InstanceId(7), b"\xAA", version, tombstone)
    }

    #[test]
    fn nearest_ancestor_wins() {
        let engine = MemoryEngine::new();
        let (dag, versions) = chain(&engine, 3);
        let rows = vec![
            (data_key(versions[0], false), b"old".to_vec()),
            (data_key(versions[1], false), b"new".to_vec()),
        ];
        let resolver = ReadResolver::new(&dag, versions[2]);
        assert_eq!(
            resolver.pick_visible(rows).unwrap(),
            Visible::Value {
                version: versions[1],
                value: b"new".to_vec()
            }
        );
    }

    #[test]
    fn tombstone_masks_ancestors() {
        let engine = MemoryEngine::new();
        let (dag, versions) = chain(&engine, 3);
        let rows = vec![
            (data_key(versions[0], false), b"old".to_vec()),
            (data_key(versions[1], true), Vec::new()),
        ];
        let resolver = ReadResolver::new(&dag, versions[2]);
        assert_eq!(resolver.pick_visible(rows).unwrap(), Visible::Deleted);
    }

    #[test]
    fn tombstone_beats_value_at_same_version() {
        let engine = MemoryEngine::new();
        let (dag, versions) = chain(&engine, 2);
        let rows = vec![
            (data_key(versions[1], false), b"val".to_vec()),
            (data_key(versions[1], true), Vec::new()),
        ];
        let resolver = ReadResolver::new(&dag, versions[1]);
        assert_eq!(resolver.pick_visible(rows).unwrap(), Visible::Deleted);
    }

    #[test]
    fn unrelated_version_is_absent() {
        let engine = MemoryEngine::new();
        let (dag, versions) = chain(&engine, 2);
        // A sibling branch that is not on versions[1]'s ancestor path.
        let sibling = dag.new_version(&engine, versions[0]).unwrap();
        let rows = vec![(data_key(sibling, false), b"other".to_vec())];
        let resolver = ReadResolver::new(&dag, versions[1]);
        assert_eq!(resolver.pick_visible(rows).unwrap(), Visible::Absent);
    }
}
