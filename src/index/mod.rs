//! Per-label index: voxel count plus the sorted set of block coordinates
//! containing the label. Entries are keyed by (instance, label, version) in
//! the label-index key class, written in batches and deleted by tombstone so
//! a child version can hide a parent's entry.

use std::sync::Arc;

use crate::dag::VersionDag;
use crate::engine::{KvBatch, KvEngine};
use crate::error::{Result, StrataError};
use crate::model::{BlockCoord, InstanceId, Label, VersionId, IZYX_LEN};
use crate::storage::context::{Context, VersionedContext};

/// Ascending Z-major list of block coordinates.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct SortedIzyx(Vec<BlockCoord>);

impl SortedIzyx {
    pub fn new(mut coords: Vec<BlockCoord>) -> Self {
        coords.sort();
        coords.dedup();
        Self(coords)
    }

    pub fn from_sorted(coords: Vec<BlockCoord>) -> Result<Self> {
        if coords.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StrataError::Invalid("block list not strictly ascending"));
        }
        Ok(Self(coords))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, coord: &BlockCoord) -> bool {
        self.0.binary_search(coord).is_ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockCoord> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[BlockCoord] {
        &self.0
    }

    /// Sorted-set union; linear in the combined length.
    pub fn merge(&self, other: &SortedIzyx) -> SortedIzyx {
        let mut out = Vec::with_capacity(self.0.len() + other.0.len());
        let (mut a, mut b) = (0, 0);
        while a < self.0.len() && b < other.0.len() {
            match self.0[a].cmp(&other.0[b]) {
                std::cmp::Ordering::Less => {
                    out.push(self.0[a]);
                    a += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(other.0[b]);
                    b += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(self.0[a]);
                    a += 1;
                    b += 1;
                }
            }
        }
        out.extend_from_slice(&self.0[a..]);
        out.extend_from_slice(&other.0[b..]);
        SortedIzyx(out)
    }

    /// Sorted-set difference; linear in the combined length.
    pub fn split(&self, remove: &SortedIzyx) -> SortedIzyx {
        let mut out = Vec::with_capacity(self.0.len());
        let mut b = 0;
        for coord in &self.0 {
            while b < remove.0.len() && remove.0[b] < *coord {
                b += 1;
            }
            if b < remove.0.len() && remove.0[b] == *coord {
                b += 1;
                continue;
            }
            out.push(*coord);
        }
        SortedIzyx(out)
    }
}

impl From<Vec<BlockCoord>> for SortedIzyx {
    fn from(coords: Vec<BlockCoord>) -> Self {
        Self::new(coords)
    }
}

/// Index entry for one label at one version.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Meta {
    pub voxels: u64,
    pub blocks: SortedIzyx,
}

impl Meta {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + IZYX_LEN * self.blocks.len());
        buf.extend_from_slice(&self.voxels.to_be_bytes());
        buf.extend_from_slice(&(self.blocks.len() as u32).to_be_bytes());
        for coord in self.blocks.iter() {
            buf.extend_from_slice(&coord.izyx());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(StrataError::Corruption("label meta truncated"));
        }
        let voxels = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let count = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        if buf.len() != 12 + count * IZYX_LEN {
            return Err(StrataError::Corruption("label meta block list truncated"));
        }
        let mut coords = Vec::with_capacity(count);
        for i in 0..count {
            let off = 12 + i * IZYX_LEN;
            coords.push(BlockCoord::from_izyx(&buf[off..off + IZYX_LEN])?);
        }
        if coords.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StrataError::Corruption("label meta blocks unsorted"));
        }
        Ok(Self {
            voxels,
            blocks: SortedIzyx(coords),
        })
    }
}

/// Type-key of a label's index entry.
pub fn label_type_key(label: Label) -> [u8; 8] {
    label.to_be_bytes()
}

/// Access to label index entries for one data instance.
pub struct LabelIndexStore {
    engine: Arc<dyn KvEngine>,
    dag: Arc<VersionDag>,
    instance: InstanceId,
}

impl LabelIndexStore {
    pub fn new(engine: Arc<dyn KvEngine>, dag: Arc<VersionDag>, instance: InstanceId) -> Self {
        Self {
            engine,
            dag,
            instance,
        }
    }

    fn ctx(&self, version: VersionId) -> VersionedContext {
        VersionedContext::label_index(self.instance, version, Arc::clone(&self.dag))
    }

    /// Entry visible at `version`, resolved through the ancestor path.
    pub fn get(&self, label: Label, version: VersionId) -> Result<Option<Meta>> {
        let ctx = self.ctx(version);
        match ctx.get(self.engine.as_ref(), &label_type_key(label))? {
            Some(bytes) => Ok(Some(Meta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, label: Label, version: VersionId, meta: &Meta) -> Result<()> {
        let ctx = self.ctx(version);
        ctx.put(self.engine.as_ref(), &label_type_key(label), &meta.encode())
    }

    pub fn delete(&self, label: Label, version: VersionId) -> Result<()> {
        let ctx = self.ctx(version);
        ctx.delete(self.engine.as_ref(), &label_type_key(label))
    }

    /// Stages a put into a caller-owned batch so several index updates
    /// commit atomically.
    pub fn put_batch(
        &self,
        batch: &mut dyn KvBatch,
        label: Label,
        version: VersionId,
        meta: &Meta,
    ) {
        let ctx = self.ctx(version);
        let tkey = label_type_key(label);
        batch.delete(ctx.tombstone_key(&tkey));
        batch.put(ctx.physical_key(&tkey), meta.encode());
    }

    /// Stages a tombstone delete into a caller-owned batch.
    pub fn delete_batch(&self, batch: &mut dyn KvBatch, label: Label, version: VersionId) {
        let ctx = self.ctx(version);
        let tkey = label_type_key(label);
        batch.delete(ctx.physical_key(&tkey));
        batch.put(ctx.tombstone_key(&tkey), Vec::new());
    }
}
