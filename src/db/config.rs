use std::path::PathBuf;

use crate::block::BlockCodec;
use crate::model::BlockSize;

#[derive(Clone, Debug)]
pub struct Config {
    /// Worker count for the block mutation pool; must be a power of two.
    pub shard_count: usize,
    pub block_size: BlockSize,
    pub codec: BlockCodec,
    pub mutation_log_dir: PathBuf,
    /// Sync every mutation log record to disk before proceeding.
    pub fsync_mutation_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shard_count: 32,
            block_size: BlockSize::default(),
            codec: BlockCodec::Lz4,
            mutation_log_dir: PathBuf::from("./data/mutation-log"),
            fsync_mutation_log: false,
        }
    }
}

impl Config {
    pub fn production() -> Self {
        Self {
            fsync_mutation_log: true,
            ..Self::default()
        }
    }

    pub fn benchmark() -> Self {
        Self {
            shard_count: 64,
            codec: BlockCodec::Raw,
            fsync_mutation_log: false,
            ..Self::default()
        }
    }
}
