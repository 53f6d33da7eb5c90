use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use super::{KeyValue, KvBatch, KvEngine, RangeIter};
use crate::error::Result;

/// In-memory ordered engine over a `BTreeMap`. Range scans snapshot the
/// matching rows under the read lock, so an iterator never observes writes
/// that land after it was created.
#[derive(Default)]
pub struct MemoryEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn range(&self, begin: &[u8], end: &[u8], keys_only: bool) -> Result<RangeIter<'_>> {
        if begin > end {
            return Ok(Box::new(std::iter::empty()));
        }
        let rows: Vec<KeyValue> = self
            .map
            .read()
            .range::<[u8], _>((Bound::Included(begin), Bound::Included(end)))
            .map(|(k, v)| {
                (
                    k.clone(),
                    if keys_only { Vec::new() } else { v.clone() },
                )
            })
            .collect();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn batch(&self) -> Box<dyn KvBatch + '_> {
        Box::new(MemoryBatch {
            engine: self,
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemoryBatch<'a> {
    engine: &'a MemoryEngine,
    ops: Vec<BatchOp>,
}

impl KvBatch for MemoryBatch<'_> {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut map = self.engine.map.write();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive_and_ordered() -> Result<()> {
        let engine = MemoryEngine::new();
        engine.put(b"a", b"1")?;
        engine.put(b"b", b"2")?;
        engine.put(b"c", b"3")?;
        engine.put(b"d", b"4")?;
        let rows: Vec<KeyValue> = engine
            .range(b"b", b"c", false)?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            rows,
            vec![
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec())
            ]
        );
        Ok(())
    }

    #[test]
    fn batch_commit_is_atomic_for_readers() -> Result<()> {
        let engine = MemoryEngine::new();
        engine.put(b"k1", b"old")?;
        let mut batch = engine.batch();
        batch.put(b"k1".to_vec(), b"new".to_vec());
        batch.put(b"k2".to_vec(), b"two".to_vec());
        batch.delete(b"k3".to_vec());
        assert_eq!(engine.get(b"k1")?, Some(b"old".to_vec()));
        batch.commit()?;
        assert_eq!(engine.get(b"k1")?, Some(b"new".to_vec()));
        assert_eq!(engine.get(b"k2")?, Some(b"two".to_vec()));
        Ok(())
    }

    #[test]
    fn range_snapshot_ignores_later_writes() -> Result<()> {
        let engine = MemoryEngine::new();
        engine.put(b"a", b"1")?;
        let iter = engine.range(b"a", b"z", false)?;
        engine.put(b"b", b"2")?;
        let rows: Vec<KeyValue> = iter.collect::<Result<Vec<_>>>()?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }

    #[test]
    fn keys_only_range_omits_values() -> Result<()> {
        let engine = MemoryEngine::new();
        engine.put(b"a", b"payload")?;
        let rows: Vec<KeyValue> = engine
            .range(b"a", b"a", true)?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(rows, vec![(b"a".to_vec(), Vec::new())]);
        Ok(())
    }
}
