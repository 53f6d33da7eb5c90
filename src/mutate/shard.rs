//! Sharded single-consumer queues for block mutations.
//!
//! Every block coordinate hashes to exactly one shard, so two operations on
//! the same block are applied in submission order, while operations on
//! different blocks run in parallel across shards. Workers load the block
//! visible at the operation's version, rewrite labels, and store the result
//! at that version, so an ancestor's block is copied forward on first touch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::block::{BlockCodec, LabelBlock};
use crate::dag::VersionDag;
use crate::engine::KvEngine;
use crate::error::{Result, StrataError};
use crate::events::{Event, EventBus};
use crate::model::{BlockCoord, BlockSize, InstanceId, Label, LabelSet, MutationId, Rle, VersionId};
use crate::storage::context::VersionedContext;

/// Counting barrier. The coordinator adds one per dispatched block and waits;
/// workers signal completion whether the block succeeded or failed.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WgInner>,
}

#[derive(Default)]
struct WgInner {
    count: Mutex<u64>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        *self.inner.count.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.cond.wait(&mut count);
        }
    }
}

/// Shared cancellation flag consulted by workers before each message and by
/// the coordinator between stages. Cancellation never rolls back applied
/// block rewrites; it only skips pending work.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-mutation results accumulated across workers.
#[derive(Clone, Default)]
pub struct OutcomeSink {
    inner: Arc<OutcomeInner>,
}

#[derive(Default)]
struct OutcomeInner {
    voxels: AtomicU64,
    failed_blocks: AtomicU64,
    first_error: Mutex<Option<StrataError>>,
    emptied: Mutex<Vec<BlockCoord>>,
}

impl OutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_voxels(&self, n: u64) {
        self.inner.voxels.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_emptied(&self, block: BlockCoord) {
        self.inner.emptied.lock().push(block);
    }

    pub fn record_failure(&self, err: StrataError) {
        self.inner.failed_blocks.fetch_add(1, Ordering::Relaxed);
        let mut first = self.inner.first_error.lock();
        if first.is_none() {
            *first = Some(err);
        }
    }

    pub fn voxels(&self) -> u64 {
        self.inner.voxels.load(Ordering::Relaxed)
    }

    pub fn failed_blocks(&self) -> u64 {
        self.inner.failed_blocks.load(Ordering::Relaxed)
    }

    pub fn take_first_error(&self) -> Option<StrataError> {
        self.inner.first_error.lock().take()
    }

    pub fn emptied_sorted(&self) -> Vec<BlockCoord> {
        let mut blocks = self.inner.emptied.lock().clone();
        blocks.sort();
        blocks
    }
}

#[derive(Clone, Debug)]
pub enum BlockOp {
    Merge {
        target: Label,
        merged: Arc<LabelSet>,
    },
    SplitCoarse {
        old_label: Label,
        new_label: Label,
    },
    SplitFine {
        old_label: Label,
        new_label: Label,
        rles: Vec<Rle>,
    },
}

pub struct BlockMsg {
    pub op: BlockOp,
    pub block: BlockCoord,
    pub version: VersionId,
    pub mutation: MutationId,
    pub wg: WaitGroup,
    pub cancel: CancelToken,
    pub outcome: OutcomeSink,
}

/// Everything a worker needs to rewrite blocks for one instance.
pub struct ShardCtx {
    pub engine: Arc<dyn KvEngine>,
    pub dag: Arc<VersionDag>,
    pub bus: Arc<EventBus>,
    pub instance: InstanceId,
    pub block_size: BlockSize,
    pub codec: BlockCodec,
}

pub struct ShardPool {
    senders: Vec<Sender<BlockMsg>>,
    handles: Vec<thread::JoinHandle<()>>,
    mask: usize,
}

impl ShardPool {
    /// Spawns `shards` workers. The count must be a power of two so routing
    /// reduces to a mask.
    pub fn spawn(shards: usize, ctx: Arc<ShardCtx>) -> Result<Self> {
        if shards == 0 || !shards.is_power_of_two() {
            return Err(StrataError::Invalid("shard count must be a power of two"));
        }
        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx): (Sender<BlockMsg>, Receiver<BlockMsg>) = mpsc::channel();
            let worker_ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("strata-shard-{shard}"))
                .spawn(move || worker_loop(shard, rx, worker_ctx))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            senders,
            handles,
            mask: shards - 1,
        })
    }

    pub fn shard_of(&self, block: BlockCoord) -> usize {
        (block.hash64() as usize) & self.mask
    }

    /// Queues one block operation on its shard. Adds to the message's
    /// WaitGroup before handing it off; the worker signals completion.
    pub fn submit(&self, msg: BlockMsg) -> Result<()> {
        let shard = self.shard_of(msg.block);
        msg.wg.add(1);
        if let Err(returned) = self.senders[shard].send(msg) {
            returned.0.wg.done();
            return Err(StrataError::Corruption("block shard channel closed"));
        }
        Ok(())
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shard: usize, rx: Receiver<BlockMsg>, ctx: Arc<ShardCtx>) {
    while let Ok(msg) = rx.recv() {
        if msg.cancel.is_canceled() {
            msg.wg.done();
            continue;
        }
        if let Err(err) = process_block(&ctx, &msg) {
            error!(
                shard,
                block = %msg.block,
                mutation = msg.mutation.0,
                %err,
                "mutate.block.failed"
            );
            msg.outcome.record_failure(err);
        }
        msg.wg.done();
    }
}

fn process_block(ctx: &ShardCtx, msg: &BlockMsg) -> Result<()> {
    let vctx = VersionedContext::data(ctx.instance, msg.version, Arc::clone(&ctx.dag));
    let tkey = msg.block.izyx();
    let payload = vctx
        .get(ctx.engine.as_ref(), &tkey)?
        .ok_or(StrataError::NotFound)?;
    let mut block = LabelBlock::decode(ctx.block_size, &payload)?;

    match &msg.op {
        BlockOp::Merge { target, merged } => {
            let changed = block.merge_set(*target, merged);
            msg.outcome.add_voxels(changed);
        }
        BlockOp::SplitCoarse {
            old_label,
            new_label,
        } => {
            let moved = block.replace_label(*old_label, *new_label);
            msg.outcome.add_voxels(moved);
        }
        BlockOp::SplitFine {
            old_label,
            new_label,
            rles,
        } => {
            let outcome = block.split_fine(msg.block, rles, *old_label, *new_label)?;
            msg.outcome.add_voxels(outcome.relabeled);
            if !outcome.old_remains {
                msg.outcome.record_emptied(msg.block);
            }
        }
    }

    vctx.put(ctx.engine.as_ref(), &tkey, &block.encode(ctx.codec))?;

    match &msg.op {
        BlockOp::SplitCoarse {
            old_label,
            new_label,
        }
        | BlockOp::SplitFine {
            old_label,
            new_label,
            ..
        } => {
            ctx.bus.publish(&Event::SplitBlock {
                instance: ctx.instance,
                version: msg.version,
                mutation: msg.mutation,
                old_label: *old_label,
                new_label: *new_label,
                block: msg.block,
            });
        }
        BlockOp::Merge { .. } => {}
    }
    ctx.bus.publish(&Event::BlockChanged {
        instance: ctx.instance,
        version: msg.version,
        mutation: msg.mutation,
        block: msg.block,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::time::Duration;

    #[test]
    fn waitgroup_blocks_until_all_done() {
        let wg = WaitGroup::new();
        wg.add(2);
        let waiter = wg.clone();
        let handle = thread::spawn(move || {
            waiter.wait();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        wg.done();
        wg.done();
        handle.join().unwrap();
    }

    #[test]
    fn shard_routing_is_stable() {
        let engine: Arc<dyn KvEngine> = Arc::new(MemoryEngine::new());
        let dag = Arc::new(VersionDag::new());
        let ctx = Arc::new(ShardCtx {
            engine,
            dag,
            bus: Arc::new(EventBus::new()),
            instance: InstanceId(1),
            block_size: BlockSize::cube(2),
            codec: BlockCodec::Raw,
        });
        let pool = ShardPool::spawn(8, ctx).unwrap();
        let block = BlockCoord::new(3, -2, 7);
        assert_eq!(pool.shard_of(block), pool.shard_of(block));
    }

    #[test]
    fn spawn_rejects_non_power_of_two() {
        let engine: Arc<dyn KvEngine> = Arc::new(MemoryEngine::new());
        let dag = Arc::new(VersionDag::new());
        let ctx = Arc::new(ShardCtx {
            engine,
            dag,
            bus: Arc::new(EventBus::new()),
            instance: InstanceId(1),
            block_size: BlockSize::cube(2),
            codec: BlockCodec::Raw,
        });
        assert!(ShardPool::spawn(12, ctx).is_err());
    }

    #[test]
    fn canceled_messages_are_skipped_but_signaled() -> Result<()> {
        let engine: Arc<dyn KvEngine> = Arc::new(MemoryEngine::new());
        let dag = Arc::new(VersionDag::new());
        let version = dag.new_root(engine.as_ref())?;
        let ctx = Arc::new(ShardCtx {
            engine: Arc::clone(&engine),
            dag: Arc::clone(&dag),
            bus: Arc::new(EventBus::new()),
            instance: InstanceId(1),
            block_size: BlockSize::cube(2),
            codec: BlockCodec::Raw,
        });
        let block = BlockCoord::new(0, 0, 0);
        let vctx = VersionedContext::data(InstanceId(1), version, Arc::clone(&dag));
        let stored = LabelBlock::solid(BlockSize::cube(2), 5).encode(BlockCodec::Raw);
        vctx.put(engine.as_ref(), &block.izyx(), &stored)?;

        let pool = ShardPool::spawn(2, ctx)?;
        let wg = WaitGroup::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = OutcomeSink::new();
        pool.submit(BlockMsg {
            op: BlockOp::SplitCoarse {
                old_label: 5,
                new_label: 6,
            },
            block,
            version,
            mutation: MutationId(1),
            wg: wg.clone(),
            cancel,
            outcome: outcome.clone(),
        })?;
        wg.wait();
        assert_eq!(outcome.voxels(), 0);
        let after = vctx.get(engine.as_ref(), &block.izyx())?.unwrap();
        assert_eq!(after, stored);
        Ok(())
    }
}
