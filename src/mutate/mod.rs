//! Merge/split coordination for label volumes.
//!
//! A mutation reserves an id, marks its labels dirty so overlapping
//! mutations are rejected, writes an intent record, fans block work out to
//! the shard pool, waits on the barrier, then updates the label index in a
//! single batch and publishes lifecycle events. Per-block failures never
//! abort in-flight work: blocks are independent and the index update is
//! best-effort over the blocks that succeeded.

pub mod shard;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::block::BlockCodec;
use crate::dag::VersionDag;
use crate::engine::KvEngine;
use crate::error::{Result, StrataError};
use crate::events::{Event, EventBus};
use crate::index::{LabelIndexStore, Meta, SortedIzyx};
use crate::model::{
    partition_rles, BlockCoord, BlockSize, InstanceId, Label, LabelSet, MutationId, Rle,
    VersionId, VoxelPoint, IZYX_LEN,
};
use crate::mutlog::{LogRecord, MutationLog, OpKind};
use crate::storage::context::MetadataContext;

use shard::{BlockMsg, BlockOp, CancelToken, OutcomeSink, ShardCtx, ShardPool, WaitGroup};

const MAX_LABEL_TKEY: &[u8] = b"max-label";

/// How a split selects the voxels that move to the new label.
#[derive(Clone, Debug)]
pub enum SplitMode {
    /// Only voxels covered by the runs are relabeled.
    Fine(Vec<Rle>),
    /// Every voxel of the old label in each listed block is relabeled, and
    /// each listed block leaves the old label's block list unconditionally.
    Coarse(Vec<BlockCoord>),
}

/// Per-mutation report: how much work ran and how much of it failed.
#[derive(Clone, Debug, Serialize)]
pub struct MutationSummary {
    pub mutation: u64,
    pub version: u32,
    pub blocks: usize,
    pub failed_blocks: usize,
    pub voxels: u64,
    pub first_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SplitOutcome {
    pub label: Label,
    pub summary: MutationSummary,
}

/// Labels with a mutation in flight, per version. The single cross-label
/// lock: a merge or split may not start while any of its labels is dirty.
struct DirtyLabels {
    map: Arc<DashMap<VersionId, LabelSet>>,
}

impl DirtyLabels {
    fn new() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }

    fn try_mark(&self, version: VersionId, labels: &LabelSet) -> Result<DirtyGuard> {
        let mut entry = self.map.entry(version).or_default();
        if let Some(&label) = labels.iter().find(|label| entry.contains(*label)) {
            return Err(StrataError::ConflictInProgress(label));
        }
        entry.extend(labels.iter().copied());
        drop(entry);
        Ok(DirtyGuard {
            map: Arc::clone(&self.map),
            version,
            labels: labels.clone(),
        })
    }
}

struct DirtyGuard {
    map: Arc<DashMap<VersionId, LabelSet>>,
    version: VersionId,
    labels: LabelSet,
}

impl Drop for DirtyGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.map.get_mut(&self.version) {
            for label in &self.labels {
                entry.remove(label);
            }
        }
    }
}

/// Orchestrates merges and splits for one data instance.
pub struct LabelMutator {
    engine: Arc<dyn KvEngine>,
    dag: Arc<VersionDag>,
    bus: Arc<EventBus>,
    instance: InstanceId,
    block_size: BlockSize,
    pool: ShardPool,
    index: LabelIndexStore,
    dirty: DirtyLabels,
    log: MutationLog,
    next_mutation: AtomicU64,
    max_label: Mutex<Label>,
}

impl LabelMutator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn KvEngine>,
        dag: Arc<VersionDag>,
        bus: Arc<EventBus>,
        instance: InstanceId,
        block_size: BlockSize,
        codec: BlockCodec,
        shards: usize,
        log_dir: &Path,
        fsync_log: bool,
    ) -> Result<Self> {
        let shard_ctx = Arc::new(ShardCtx {
            engine: Arc::clone(&engine),
            dag: Arc::clone(&dag),
            bus: Arc::clone(&bus),
            instance,
            block_size,
            codec,
        });
        let pool = ShardPool::spawn(shards, shard_ctx)?;
        let log = MutationLog::open(log_dir, instance, fsync_log)?;
        let next_mutation = log
            .replay()?
            .iter()
            .map(|record| record.mutation.0)
            .max()
            .unwrap_or(0)
            + 1;
        let index = LabelIndexStore::new(Arc::clone(&engine), Arc::clone(&dag), instance);
        let max_label = load_max_label(engine.as_ref(), instance)?;
        Ok(Self {
            engine,
            dag,
            bus,
            instance,
            block_size,
            pool,
            index,
            dirty: DirtyLabels::new(),
            log,
            next_mutation: AtomicU64::new(next_mutation),
            max_label: Mutex::new(max_label),
        })
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn index(&self) -> &LabelIndexStore {
        &self.index
    }

    fn reserve_mutation(&self) -> MutationId {
        MutationId(self.next_mutation.fetch_add(1, Ordering::SeqCst))
    }

    /// Records that `label` exists so allocation never reuses it.
    pub fn note_label(&self, label: Label) -> Result<()> {
        let mut max = self.max_label.lock();
        if label > *max {
            *max = label;
            store_max_label(self.engine.as_ref(), self.instance, *max)?;
        }
        Ok(())
    }

    /// Allocates the next unused label and persists the high-water mark.
    pub fn new_label(&self) -> Result<Label> {
        let mut max = self.max_label.lock();
        *max += 1;
        store_max_label(self.engine.as_ref(), self.instance, *max)?;
        Ok(*max)
    }

    pub fn merge(&self, version: VersionId, target: Label, merged: LabelSet) -> Result<MutationSummary> {
        self.merge_with_cancel(version, target, merged, CancelToken::new())
    }

    /// Merges every label in `merged` into `target` at `version`. The merged
    /// labels' index entries are tombstoned; the target's entry absorbs
    /// their blocks and voxel counts.
    pub fn merge_with_cancel(
        &self,
        version: VersionId,
        target: Label,
        merged: LabelSet,
        cancel: CancelToken,
    ) -> Result<MutationSummary> {
        if merged.is_empty() {
            return Err(StrataError::Invalid("merge needs at least one label"));
        }
        if merged.contains(&target) {
            return Err(StrataError::Invalid("merge target cannot be in merged set"));
        }
        if self.dag.is_locked(version)? {
            return Err(StrataError::VersionLocked(version));
        }
        let mut involved = merged.clone();
        involved.insert(target);
        let _guard = self.dirty.try_mark(version, &involved)?;
        let mutation = self.reserve_mutation();
        self.run_merge(version, target, &merged, mutation, &cancel)
            .map_err(|err| err.with_mutation(mutation))
    }

    fn run_merge(
        &self,
        version: VersionId,
        target: Label,
        merged: &LabelSet,
        mutation: MutationId,
        cancel: &CancelToken,
    ) -> Result<MutationSummary> {
        self.log.append(&LogRecord {
            mutation,
            version,
            kind: OpKind::MergeStart,
            payload: encode_merge_payload(target, merged),
        })?;
        self.bus.publish(&Event::MergeStart {
            instance: self.instance,
            version,
            mutation,
            target,
            merged: merged.clone(),
        });
        debug!(
            instance = self.instance.0,
            version = version.0,
            mutation = mutation.0,
            target,
            merged = merged.len(),
            "mutate.merge.start"
        );

        let target_meta = self.index.get(target, version)?.ok_or(StrataError::NotFound)?;
        let mut merged_voxels = 0u64;
        let mut all_blocks = target_meta.blocks.clone();
        for &label in merged {
            let meta = self.index.get(label, version)?.ok_or(StrataError::NotFound)?;
            merged_voxels += meta.voxels;
            all_blocks = all_blocks.merge(&meta.blocks);
        }

        self.bus.publish(&Event::MergeBlock {
            instance: self.instance,
            version,
            mutation,
            target,
            merged: merged.clone(),
            blocks: all_blocks.as_slice().to_vec(),
        });

        if cancel.is_canceled() {
            return Err(StrataError::Canceled);
        }
        let wg = WaitGroup::new();
        let outcome = OutcomeSink::new();
        let merged_set = Arc::new(merged.clone());
        let dispatched = all_blocks.len();
        for &block in all_blocks.iter() {
            self.pool.submit(BlockMsg {
                op: BlockOp::Merge {
                    target,
                    merged: Arc::clone(&merged_set),
                },
                block,
                version,
                mutation,
                wg: wg.clone(),
                cancel: cancel.clone(),
                outcome: outcome.clone(),
            })?;
        }
        wg.wait();
        if cancel.is_canceled() {
            return Err(StrataError::Canceled);
        }
        let failed_blocks = outcome.failed_blocks() as usize;
        if dispatched > 0 && failed_blocks == dispatched {
            return Err(outcome
                .take_first_error()
                .unwrap_or(StrataError::Corruption("all merge blocks failed")));
        }

        let new_meta = Meta {
            voxels: target_meta.voxels + merged_voxels,
            blocks: all_blocks,
        };
        let mut batch = self.engine.batch();
        self.index.put_batch(batch.as_mut(), target, version, &new_meta);
        for &label in merged {
            self.index.delete_batch(batch.as_mut(), label, version);
        }
        batch.commit()?;

        self.bus.publish(&Event::ChangeSize {
            instance: self.instance,
            version,
            label: target,
            old_voxels: target_meta.voxels,
            new_voxels: new_meta.voxels,
        });
        self.bus.publish(&Event::MergeEnd {
            instance: self.instance,
            version,
            mutation,
            target,
            merged: merged.clone(),
        });
        self.log.append(&LogRecord {
            mutation,
            version,
            kind: OpKind::MergeEnd,
            payload: Vec::new(),
        })?;
        debug!(
            instance = self.instance.0,
            mutation = mutation.0,
            blocks = new_meta.blocks.len(),
            failed_blocks,
            "mutate.merge.end"
        );

        Ok(MutationSummary {
            mutation: mutation.0,
            version: version.0,
            blocks: new_meta.blocks.len(),
            failed_blocks,
            voxels: new_meta.voxels,
            first_error: outcome.take_first_error().map(|e| e.to_string()),
        })
    }

    pub fn split(
        &self,
        version: VersionId,
        from: Label,
        to: Label,
        mode: SplitMode,
    ) -> Result<SplitOutcome> {
        self.split_with_cancel(version, from, to, mode, CancelToken::new())
    }

    /// Moves part of `from` to a new label at `version`. With `to == 0` a
    /// fresh label is allocated; the chosen label is returned either way.
    pub fn split_with_cancel(
        &self,
        version: VersionId,
        from: Label,
        to: Label,
        mode: SplitMode,
        cancel: CancelToken,
    ) -> Result<SplitOutcome> {
        if from == 0 {
            return Err(StrataError::Invalid("cannot split label 0"));
        }
        if to == from {
            return Err(StrataError::Invalid("split target equals source label"));
        }
        if self.dag.is_locked(version)? {
            return Err(StrataError::VersionLocked(version));
        }
        let new_label = if to == 0 { self.new_label()? } else { to };
        let involved = LabelSet::from([from, new_label]);
        let _guard = self.dirty.try_mark(version, &involved)?;
        let mutation = self.reserve_mutation();
        let summary = self
            .run_split(version, from, new_label, &mode, mutation, &cancel)
            .map_err(|err| err.with_mutation(mutation))?;
        Ok(SplitOutcome {
            label: new_label,
            summary,
        })
    }

    fn run_split(
        &self,
        version: VersionId,
        from: Label,
        new_label: Label,
        mode: &SplitMode,
        mutation: MutationId,
        cancel: &CancelToken,
    ) -> Result<MutationSummary> {
        // Partition up front so a malformed payload fails before any intent
        // record or event leaves this call.
        let (plan, coarse): (Vec<(BlockCoord, BlockOp)>, bool) = match mode {
            SplitMode::Fine(rles) => {
                let partition = partition_rles(rles, self.block_size)?;
                (
                    partition
                        .into_iter()
                        .map(|(block, block_rles)| {
                            (
                                block,
                                BlockOp::SplitFine {
                                    old_label: from,
                                    new_label,
                                    rles: block_rles,
                                },
                            )
                        })
                        .collect(),
                    false,
                )
            }
            SplitMode::Coarse(blocks) => {
                let listed = SortedIzyx::new(blocks.clone());
                (
                    listed
                        .iter()
                        .map(|&block| {
                            (
                                block,
                                BlockOp::SplitCoarse {
                                    old_label: from,
                                    new_label,
                                },
                            )
                        })
                        .collect(),
                    true,
                )
            }
        };
        let touched: Vec<BlockCoord> = plan.iter().map(|(block, _)| *block).collect();

        self.log.append(&LogRecord {
            mutation,
            version,
            kind: OpKind::SplitStart,
            payload: encode_split_payload(from, new_label, mode),
        })?;
        self.bus.publish(&Event::SplitStart {
            instance: self.instance,
            version,
            mutation,
            old_label: from,
            new_label,
        });
        debug!(
            instance = self.instance.0,
            version = version.0,
            mutation = mutation.0,
            from,
            new_label,
            "mutate.split.start"
        );
        if cancel.is_canceled() {
            return Err(StrataError::Canceled);
        }

        let wg = WaitGroup::new();
        let outcome = OutcomeSink::new();
        for (block, op) in plan {
            self.pool.submit(BlockMsg {
                op,
                block,
                version,
                mutation,
                wg: wg.clone(),
                cancel: cancel.clone(),
                outcome: outcome.clone(),
            })?;
        }
        wg.wait();
        if cancel.is_canceled() {
            return Err(StrataError::Canceled);
        }
        let dispatched = touched.len();
        let failed_blocks = outcome.failed_blocks() as usize;
        if dispatched > 0 && failed_blocks == dispatched {
            return Err(outcome
                .take_first_error()
                .unwrap_or(StrataError::Corruption("all split blocks failed")));
        }

        let split_voxels = outcome.voxels();
        let removed = if coarse {
            // Listed blocks always leave the old label's block list.
            SortedIzyx::new(touched.clone())
        } else {
            SortedIzyx::new(outcome.emptied_sorted())
        };

        let old_meta = self.index.get(from, version)?.ok_or(StrataError::NotFound)?;
        let old_updated = Meta {
            voxels: old_meta.voxels.saturating_sub(split_voxels),
            blocks: old_meta.blocks.split(&removed),
        };
        let new_meta = Meta {
            voxels: split_voxels,
            blocks: SortedIzyx::new(touched.clone()),
        };
        let mut batch = self.engine.batch();
        self.index.put_batch(batch.as_mut(), from, version, &old_updated);
        self.index.put_batch(batch.as_mut(), new_label, version, &new_meta);
        batch.commit()?;

        self.bus.publish(&Event::ChangeSize {
            instance: self.instance,
            version,
            label: from,
            old_voxels: old_meta.voxels,
            new_voxels: old_updated.voxels,
        });
        self.bus.publish(&Event::ChangeSize {
            instance: self.instance,
            version,
            label: new_label,
            old_voxels: 0,
            new_voxels: split_voxels,
        });
        self.bus.publish(&Event::SplitLabel {
            instance: self.instance,
            version,
            mutation,
            old_label: from,
            new_label,
            blocks: touched.clone(),
        });
        self.bus.publish(&Event::SplitEnd {
            instance: self.instance,
            version,
            mutation,
            old_label: from,
            new_label,
        });
        self.log.append(&LogRecord {
            mutation,
            version,
            kind: OpKind::SplitEnd,
            payload: Vec::new(),
        })?;
        debug!(
            instance = self.instance.0,
            mutation = mutation.0,
            blocks = dispatched,
            voxels = split_voxels,
            failed_blocks,
            "mutate.split.end"
        );

        Ok(MutationSummary {
            mutation: mutation.0,
            version: version.0,
            blocks: dispatched,
            failed_blocks,
            voxels: split_voxels,
            first_error: outcome.take_first_error().map(|e| e.to_string()),
        })
    }

    /// Re-drives mutations whose intent record has no matching completion.
    /// Block relabeling is idempotent, so a mutation that finished its block
    /// work but crashed before the completion record is safe to run again.
    pub fn recover(&self) -> Result<Vec<MutationId>> {
        let pending = self.log.unfinished()?;
        let mut redriven = Vec::new();
        for record in pending {
            let outcome = match record.kind {
                OpKind::MergeStart => {
                    let (target, merged) = decode_merge_payload(&record.payload)?;
                    self.merge(record.version, target, merged).map(|_| ())
                }
                OpKind::SplitStart => {
                    let (from, to, mode) = decode_split_payload(&record.payload)?;
                    self.split(record.version, from, to, mode).map(|_| ())
                }
                _ => continue,
            };
            match outcome {
                Ok(()) => redriven.push(record.mutation),
                Err(err) => {
                    // A missing index entry means the original run already
                    // rewrote the index before crashing; nothing to redo.
                    let resolved = match &err {
                        StrataError::NotFound => true,
                        StrataError::Mutation { source, .. } => {
                            matches!(**source, StrataError::NotFound)
                        }
                        _ => false,
                    };
                    warn!(
                        mutation = record.mutation.0,
                        resolved,
                        %err,
                        "mutate.recover.skip"
                    );
                    if !resolved {
                        return Err(err);
                    }
                }
            }
        }
        Ok(redriven)
    }
}

fn load_max_label(engine: &dyn KvEngine, instance: InstanceId) -> Result<Label> {
    let ctx = MetadataContext::new(instance);
    match ctx.get(engine, MAX_LABEL_TKEY)? {
        Some(bytes) => {
            if bytes.len() != 8 {
                return Err(StrataError::Corruption("max label record truncated"));
            }
            Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
        }
        None => Ok(0),
    }
}

fn store_max_label(engine: &dyn KvEngine, instance: InstanceId, max: Label) -> Result<()> {
    let ctx = MetadataContext::new(instance);
    ctx.put(engine, MAX_LABEL_TKEY, &max.to_be_bytes())
}

fn encode_merge_payload(target: Label, merged: &LabelSet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + 8 * merged.len());
    buf.extend_from_slice(&target.to_be_bytes());
    buf.extend_from_slice(&(merged.len() as u32).to_be_bytes());
    for label in merged {
        buf.extend_from_slice(&label.to_be_bytes());
    }
    buf
}

fn decode_merge_payload(buf: &[u8]) -> Result<(Label, LabelSet)> {
    if buf.len() < 12 {
        return Err(StrataError::Corruption("merge payload truncated"));
    }
    let target = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let count = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
    if buf.len() != 12 + 8 * count {
        return Err(StrataError::Corruption("merge payload truncated"));
    }
    let mut merged = LabelSet::new();
    for i in 0..count {
        let off = 12 + 8 * i;
        merged.insert(u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()));
    }
    Ok((target, merged))
}

const SPLIT_MODE_COARSE: u8 = 0;
const SPLIT_MODE_FINE: u8 = 1;

fn encode_split_payload(from: Label, new_label: Label, mode: &SplitMode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(21);
    buf.extend_from_slice(&from.to_be_bytes());
    buf.extend_from_slice(&new_label.to_be_bytes());
    match mode {
        SplitMode::Coarse(blocks) => {
            buf.push(SPLIT_MODE_COARSE);
            buf.extend_from_slice(&(blocks.len() as u32).to_be_bytes());
            for block in blocks {
                buf.extend_from_slice(&block.izyx());
            }
        }
        SplitMode::Fine(rles) => {
            buf.push(SPLIT_MODE_FINE);
            buf.extend_from_slice(&(rles.len() as u32).to_be_bytes());
            for rle in rles {
                buf.extend_from_slice(&rle.start.x.to_be_bytes());
                buf.extend_from_slice(&rle.start.y.to_be_bytes());
                buf.extend_from_slice(&rle.start.z.to_be_bytes());
                buf.extend_from_slice(&rle.length.to_be_bytes());
            }
        }
    }
    buf
}

fn decode_split_payload(buf: &[u8]) -> Result<(Label, Label, SplitMode)> {
    if buf.len() < 21 {
        return Err(StrataError::Corruption("split payload truncated"));
    }
    let from = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let new_label = u64::from_be_bytes(buf[8..16].try_into().unwrap());
    let count = u32::from_be_bytes(buf[17..21].try_into().unwrap()) as usize;
    let body = &buf[21..];
    let mode = match buf[16] {
        SPLIT_MODE_COARSE => {
            if body.len() != count * IZYX_LEN {
                return Err(StrataError::Corruption("split payload truncated"));
            }
            let mut blocks = Vec::with_capacity(count);
            for i in 0..count {
                blocks.push(BlockCoord::from_izyx(&body[i * IZYX_LEN..(i + 1) * IZYX_LEN])?);
            }
            SplitMode::Coarse(blocks)
        }
        SPLIT_MODE_FINE => {
            if body.len() != count * 16 {
                return Err(StrataError::Corruption("split payload truncated"));
            }
            let mut rles = Vec::with_capacity(count);
            for i in 0..count {
                let off = i * 16;
                let x = i32::from_be_bytes(body[off..off + 4].try_into().unwrap());
                let y = i32::from_be_bytes(body[off + 4..off + 8].try_into().unwrap());
                let z = i32::from_be_bytes(body[off + 8..off + 12].try_into().unwrap());
                let length = i32::from_be_bytes(body[off + 12..off + 16].try_into().unwrap());
                rles.push(Rle::new(VoxelPoint::new(x, y, z), length));
            }
            SplitMode::Fine(rles)
        }
        _ => return Err(StrataError::Corruption("unknown split payload mode")),
    };
    Ok((from, new_label, mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::LabelBlock;
    use crate::engine::MemoryEngine;
    use crate::storage::context::VersionedContext;
    use tempfile::TempDir;

    const SIZE: BlockSize = BlockSize::cube(4);

    fn mutator() -> (TempDir, Arc<MemoryEngine>, Arc<VersionDag>, LabelMutator) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let dag = Arc::new(VersionDag::new());
        let mutator = LabelMutator::new(
            Arc::clone(&engine) as Arc<dyn KvEngine>,
            Arc::clone(&dag),
            Arc::new(EventBus::new()),
            InstanceId(9),
            SIZE,
            BlockCodec::Raw,
            4,
            dir.path(),
            false,
        )
        .unwrap();
        (dir, engine, dag, mutator)
    }

    fn seed_block(
        engine: &MemoryEngine,
        dag: &Arc<VersionDag>,
        version: VersionId,
        coord: BlockCoord,
        label: Label,
    ) {
        let ctx = VersionedContext::data(InstanceId(9), version, Arc::clone(dag));
        let block = LabelBlock::solid(SIZE, label);
        ctx.put(engine, &coord.izyx(), &block.encode(BlockCodec::Raw))
            .unwrap();
    }

    #[test]
    fn recover_redrives_unfinished_split() -> Result<()> {
        let (_dir, engine, dag, mutator) = mutator();
        let version = dag.new_root(engine.as_ref())?;
        let coord = BlockCoord::new(0, 0, 0);
        seed_block(&engine, &dag, version, coord, 5);
        mutator.index.put(
            5,
            version,
            &Meta {
                voxels: SIZE.voxels() as u64,
                blocks: SortedIzyx::new(vec![coord]),
            },
        )?;

        // An intent with no completion, as left behind by a crash.
        mutator.log.append(&LogRecord {
            mutation: MutationId(77),
            version,
            kind: OpKind::SplitStart,
            payload: encode_split_payload(5, 6, &SplitMode::Coarse(vec![coord])),
        })?;

        let redriven = mutator.recover()?;
        assert_eq!(redriven, vec![MutationId(77)]);
        let ctx = VersionedContext::data(InstanceId(9), version, Arc::clone(&dag));
        let payload = ctx.get(engine.as_ref(), &coord.izyx())?.unwrap();
        let block = LabelBlock::decode(SIZE, &payload)?;
        assert_eq!(block.count_label(6), SIZE.voxels() as u64);
        assert!(mutator.index.get(6, version)?.is_some());
        Ok(())
    }

    #[test]
    fn recover_skips_already_applied_merge() -> Result<()> {
        let (_dir, engine, dag, mutator) = mutator();
        let version = dag.new_root(engine.as_ref())?;
        let coord = BlockCoord::new(0, 0, 0);
        seed_block(&engine, &dag, version, coord, 3);
        mutator.index.put(
            3,
            version,
            &Meta {
                voxels: SIZE.voxels() as u64,
                blocks: SortedIzyx::new(vec![coord]),
            },
        )?;

        // The merged label's index entry is gone, as after a merge that
        // finished its index batch but crashed before logging completion.
        let merged = LabelSet::from([4]);
        mutator.log.append(&LogRecord {
            mutation: MutationId(5),
            version,
            kind: OpKind::MergeStart,
            payload: encode_merge_payload(3, &merged),
        })?;

        let redriven = mutator.recover()?;
        assert!(redriven.is_empty());
        Ok(())
    }

    #[test]
    fn mutation_ids_resume_above_logged_ids() -> Result<()> {
        let (dir, engine, dag, mutator) = mutator();
        let version = dag.new_root(engine.as_ref())?;
        mutator.log.append(&LogRecord {
            mutation: MutationId(41),
            version,
            kind: OpKind::MergeStart,
            payload: encode_merge_payload(1, &LabelSet::from([2])),
        })?;
        mutator.log.append(&LogRecord {
            mutation: MutationId(41),
            version,
            kind: OpKind::MergeEnd,
            payload: Vec::new(),
        })?;
        drop(mutator);
        let reopened = LabelMutator::new(
            Arc::clone(&engine) as Arc<dyn KvEngine>,
            Arc::clone(&dag),
            Arc::new(EventBus::new()),
            InstanceId(9),
            SIZE,
            BlockCodec::Raw,
            4,
            dir.path(),
            false,
        )?;
        assert_eq!(reopened.reserve_mutation(), MutationId(42));
        Ok(())
    }

    #[test]
    fn merge_payload_roundtrip() {
        let merged = LabelSet::from([11, 12, 13]);
        let (target, decoded) = decode_merge_payload(&encode_merge_payload(10, &merged)).unwrap();
        assert_eq!(target, 10);
        assert_eq!(decoded, merged);
    }

    #[test]
    fn split_payload_roundtrip_coarse() {
        let blocks = vec![BlockCoord::new(1, 2, 3), BlockCoord::new(-1, 0, 0)];
        let payload = encode_split_payload(10, 12, &SplitMode::Coarse(blocks.clone()));
        let (from, to, mode) = decode_split_payload(&payload).unwrap();
        assert_eq!((from, to), (10, 12));
        match mode {
            SplitMode::Coarse(decoded) => assert_eq!(decoded, blocks),
            SplitMode::Fine(_) => panic!("expected coarse mode"),
        }
    }

    #[test]
    fn split_payload_roundtrip_fine() {
        let rles = vec![
            Rle::new(VoxelPoint::new(0, 1, 2), 5),
            Rle::new(VoxelPoint::new(-3, 4, 5), 2),
        ];
        let payload = encode_split_payload(7, 0, &SplitMode::Fine(rles.clone()));
        let (from, to, mode) = decode_split_payload(&payload).unwrap();
        assert_eq!((from, to), (7, 0));
        match mode {
            SplitMode::Fine(decoded) => assert_eq!(decoded, rles),
            SplitMode::Coarse(_) => panic!("expected fine mode"),
        }
    }

    #[test]
    fn split_payload_rejects_bad_mode() {
        let mut payload = encode_split_payload(7, 8, &SplitMode::Coarse(Vec::new()));
        payload[16] = 9;
        assert!(matches!(
            decode_split_payload(&payload),
            Err(StrataError::Corruption(_))
        ));
    }
}
