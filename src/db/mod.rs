//! Datastore façade: one handle tying the engine, version DAG, instance
//! registry, mutation coordinators, event bus, and mutation logs together.

mod config;

pub use config::Config;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::block::{BlockCodec, LabelBlock};
use crate::dag::{VersionDag, REPO_INSTANCE};
use crate::engine::KvEngine;
use crate::error::{Result, StrataError};
use crate::events::{EventBus, Handler, SubscriptionId, Topic};
use crate::index::Meta;
use crate::model::{BlockCoord, BlockSize, InstanceId, Label, LabelSet, MutationId, VersionId};
use crate::mutate::shard::CancelToken;
use crate::mutate::{LabelMutator, MutationSummary, SplitMode, SplitOutcome};
use crate::storage::context::{MetadataContext, VersionedContext};
use crate::storage::key::{self, KeyClass};

const INSTANCE_TAG: u8 = b'i';

struct Instances {
    by_id: HashMap<InstanceId, Arc<DataInstance>>,
    by_name: HashMap<String, InstanceId>,
    by_uuid: HashMap<Uuid, InstanceId>,
    next_id: u32,
}

pub struct Datastore {
    engine: Arc<dyn KvEngine>,
    dag: Arc<VersionDag>,
    bus: Arc<EventBus>,
    config: Config,
    instances: RwLock<Instances>,
}

impl Datastore {
    /// Opens a datastore over an engine, reloading the version graph and
    /// every registered instance.
    pub fn open(engine: Arc<dyn KvEngine>, config: Config) -> Result<Self> {
        let dag = Arc::new(VersionDag::load(engine.as_ref())?);
        let bus = Arc::new(EventBus::new());
        let mut instances = Instances {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_uuid: HashMap::new(),
            next_id: 1,
        };
        let begin = instance_key(InstanceId(0));
        let end = instance_key(InstanceId(u32::MAX));
        for row in engine.range(&begin, &end, false)? {
            let (k, v) = row?;
            let decoded = key::decode(&k)?;
            if decoded.type_key.len() != 5 || decoded.type_key[0] != INSTANCE_TAG {
                continue;
            }
            let id = InstanceId(u32::from_be_bytes(
                decoded.type_key[1..5].try_into().unwrap(),
            ));
            let (uuid, name) = decode_instance_record(&v)?;
            let instance = DataInstance::create(
                Arc::clone(&engine),
                Arc::clone(&dag),
                Arc::clone(&bus),
                id,
                uuid,
                name.clone(),
                &config,
            )?;
            instances.next_id = instances.next_id.max(id.0.saturating_add(1));
            instances.by_name.insert(name, id);
            instances.by_uuid.insert(uuid, id);
            instances.by_id.insert(id, instance);
        }
        info!(
            instances = instances.by_id.len(),
            "datastore.open"
        );
        Ok(Self {
            engine,
            dag,
            bus,
            config,
            instances: RwLock::new(instances),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    pub fn dag(&self) -> &Arc<VersionDag> {
        &self.dag
    }

    pub fn new_root_version(&self) -> Result<VersionId> {
        self.dag.new_root(self.engine.as_ref())
    }

    pub fn new_child_version(&self, parent: VersionId) -> Result<VersionId> {
        self.dag.new_version(self.engine.as_ref(), parent)
    }

    /// Locks a version, making it immutable and eligible to parent children.
    pub fn lock_version(&self, version: VersionId) -> Result<()> {
        self.dag.lock(self.engine.as_ref(), version)
    }

    pub fn version_uuid(&self, version: VersionId) -> Result<Uuid> {
        self.dag.uuid_of(version)
    }

    pub fn version_by_uuid(&self, uuid: Uuid) -> Result<VersionId> {
        self.dag.version_by_uuid(uuid)
    }

    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Registers a new data instance and spawns its mutation pool.
    pub fn create_instance(&self, name: &str) -> Result<Arc<DataInstance>> {
        let mut instances = self.instances.write();
        if instances.by_name.contains_key(name) {
            return Err(StrataError::Invalid("instance name already in use"));
        }
        let id = InstanceId(instances.next_id);
        instances.next_id = instances
            .next_id
            .checked_add(1)
            .ok_or(StrataError::Invalid("instance id space exhausted"))?;
        let uuid = Uuid::new_v4();
        self.engine.put(
            &instance_key(id),
            &encode_instance_record(uuid, name),
        )?;
        let instance = DataInstance::create(
            Arc::clone(&self.engine),
            Arc::clone(&self.dag),
            Arc::clone(&self.bus),
            id,
            uuid,
            name.to_string(),
            &self.config,
        )?;
        instances.by_name.insert(name.to_string(), id);
        instances.by_uuid.insert(uuid, id);
        instances.by_id.insert(id, Arc::clone(&instance));
        info!(instance = id.0, name, "datastore.create_instance");
        Ok(instance)
    }

    pub fn instance(&self, name: &str) -> Result<Arc<DataInstance>> {
        let instances = self.instances.read();
        let id = instances.by_name.get(name).ok_or(StrataError::NotFound)?;
        Ok(Arc::clone(&instances.by_id[id]))
    }

    pub fn instance_by_id(&self, id: InstanceId) -> Result<Arc<DataInstance>> {
        let instances = self.instances.read();
        instances
            .by_id
            .get(&id)
            .cloned()
            .ok_or(StrataError::NotFound)
    }

    pub fn instance_by_uuid(&self, uuid: Uuid) -> Result<Arc<DataInstance>> {
        let instances = self.instances.read();
        let id = instances.by_uuid.get(&uuid).ok_or(StrataError::NotFound)?;
        Ok(Arc::clone(&instances.by_id[id]))
    }

    /// Replays every instance's mutation log, re-driving mutations whose
    /// completion record is missing.
    pub fn recover(&self) -> Result<Vec<MutationId>> {
        let instances: Vec<Arc<DataInstance>> =
            self.instances.read().by_id.values().cloned().collect();
        let mut redriven = Vec::new();
        for instance in instances {
            redriven.extend(instance.recover()?);
        }
        Ok(redriven)
    }
}

/// One named label volume and its mutation machinery.
pub struct DataInstance {
    id: InstanceId,
    uuid: Uuid,
    name: String,
    engine: Arc<dyn KvEngine>,
    dag: Arc<VersionDag>,
    block_size: BlockSize,
    codec: BlockCodec,
    mutator: LabelMutator,
}

impl DataInstance {
    fn create(
        engine: Arc<dyn KvEngine>,
        dag: Arc<VersionDag>,
        bus: Arc<EventBus>,
        id: InstanceId,
        uuid: Uuid,
        name: String,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let mutator = LabelMutator::new(
            Arc::clone(&engine),
            Arc::clone(&dag),
            bus,
            id,
            config.block_size,
            config.codec,
            config.shard_count,
            &config.mutation_log_dir,
            config.fsync_mutation_log,
        )?;
        Ok(Arc::new(Self {
            id,
            uuid,
            name,
            engine,
            dag,
            block_size: config.block_size,
            codec: config.codec,
            mutator,
        }))
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn data_context(&self, version: VersionId) -> VersionedContext {
        VersionedContext::data(self.id, version, Arc::clone(&self.dag))
    }

    pub fn metadata_context(&self) -> MetadataContext {
        MetadataContext::new(self.id)
    }

    /// Stores a block at a version and records any new high label so
    /// allocation never collides with ingested data.
    pub fn put_block(&self, version: VersionId, coord: BlockCoord, block: &LabelBlock) -> Result<()> {
        if block.size() != self.block_size {
            return Err(StrataError::Invalid("block size does not match instance"));
        }
        let ctx = self.data_context(version);
        ctx.put(self.engine.as_ref(), &coord.izyx(), &block.encode(self.codec))?;
        if let Some(&max) = block.counts().keys().next_back() {
            self.mutator.note_label(max)?;
        }
        Ok(())
    }

    /// The block visible at a version, resolved through the ancestor path.
    pub fn get_block(&self, version: VersionId, coord: BlockCoord) -> Result<Option<LabelBlock>> {
        let ctx = self.data_context(version);
        match ctx.get(self.engine.as_ref(), &coord.izyx())? {
            Some(payload) => Ok(Some(LabelBlock::decode(self.block_size, &payload)?)),
            None => Ok(None),
        }
    }

    pub fn delete_block(&self, version: VersionId, coord: BlockCoord) -> Result<()> {
        let ctx = self.data_context(version);
        ctx.delete(self.engine.as_ref(), &coord.izyx())
    }

    pub fn label_meta(&self, version: VersionId, label: Label) -> Result<Option<Meta>> {
        self.mutator.index().get(label, version)
    }

    pub fn set_label_meta(&self, version: VersionId, label: Label, meta: &Meta) -> Result<()> {
        self.mutator.index().put(label, version, meta)?;
        self.mutator.note_label(label)
    }

    pub fn new_label(&self) -> Result<Label> {
        self.mutator.new_label()
    }

    pub fn merge(
        &self,
        version: VersionId,
        target: Label,
        merged: LabelSet,
    ) -> Result<MutationSummary> {
        self.mutator.merge(version, target, merged)
    }

    pub fn merge_with_cancel(
        &self,
        version: VersionId,
        target: Label,
        merged: LabelSet,
        cancel: CancelToken,
    ) -> Result<MutationSummary> {
        self.mutator.merge_with_cancel(version, target, merged, cancel)
    }

    pub fn split(
        &self,
        version: VersionId,
        from: Label,
        to: Label,
        mode: SplitMode,
    ) -> Result<SplitOutcome> {
        self.mutator.split(version, from, to, mode)
    }

    pub fn split_with_cancel(
        &self,
        version: VersionId,
        from: Label,
        to: Label,
        mode: SplitMode,
        cancel: CancelToken,
    ) -> Result<SplitOutcome> {
        self.mutator.split_with_cancel(version, from, to, mode, cancel)
    }

    pub fn recover(&self) -> Result<Vec<MutationId>> {
        self.mutator.recover()
    }
}

fn instance_key(id: InstanceId) -> Vec<u8> {
    let mut tkey = [0u8; 5];
    tkey[0] = INSTANCE_TAG;
    tkey[1..5].copy_from_slice(&id.0.to_be_bytes());
    key::encode(
        KeyClass::Metadata,
        REPO_INSTANCE,
        &tkey,
        VersionId(0),
        false,
    )
}

fn encode_instance_record(uuid: Uuid, name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + name.len());
    buf.extend_from_slice(uuid.as_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf
}

fn decode_instance_record(buf: &[u8]) -> Result<(Uuid, String)> {
    if buf.len() < 16 {
        return Err(StrataError::Corruption("instance record truncated"));
    }
    let uuid = Uuid::from_bytes(buf[0..16].try_into().unwrap());
    let name = String::from_utf8(buf[16..].to_vec())
        .map_err(|_| StrataError::Corruption("instance name not utf-8"))?;
    Ok((uuid, name))
}
