//! Label blocks: fixed 3-D tiles of 64-bit labels.
//!
//! Voxels are little-endian u64 in X-fastest order. Stored values are framed
//! `[codec:u8][payload]`; the lz4 payload carries its own uncompressed size.
//! A decoded block whose byte length does not match the configured block
//! size is corrupt.

pub mod downres;

use std::collections::BTreeMap;

use crate::error::{Result, StrataError};
use crate::model::{BlockCoord, BlockSize, Label, LabelSet, Rle};

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockCodec {
    Raw = 0,
    Lz4 = 1,
}

impl BlockCodec {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockCodec::Raw),
            1 => Ok(BlockCodec::Lz4),
            _ => Err(StrataError::Corruption("unknown block codec byte")),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LabelBlock {
    size: BlockSize,
    data: Vec<u8>,
}

/// Result of relabeling RLE-covered voxels inside one block.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FineSplitOutcome {
    pub relabeled: u64,
    pub old_remains: bool,
}

impl LabelBlock {
    /// A block filled with one label.
    pub fn solid(size: BlockSize, label: Label) -> Self {
        let mut data = vec![0u8; size.bytes()];
        if label != 0 {
            for chunk in data.chunks_exact_mut(8) {
                chunk.copy_from_slice(&label.to_le_bytes());
            }
        }
        Self { size, data }
    }

    pub fn from_raw(size: BlockSize, data: Vec<u8>) -> Result<Self> {
        if data.len() != size.bytes() {
            return Err(StrataError::Corruption("label block size mismatch"));
        }
        Ok(Self { size, data })
    }

    pub fn size(&self) -> BlockSize {
        self.size
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn decode(size: BlockSize, payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(StrataError::Corruption("empty block payload"));
        }
        let codec = BlockCodec::from_u8(payload[0])?;
        let body = &payload[1..];
        let data = match codec {
            BlockCodec::Raw => body.to_vec(),
            BlockCodec::Lz4 => lz4_flex::decompress_size_prepended(body)
                .map_err(|_| StrataError::Corruption("block decompression failed"))?,
        };
        if data.len() != size.bytes() {
            return Err(StrataError::Corruption(
                "label block size mismatch after decompression",
            ));
        }
        Ok(Self { size, data })
    }

    pub fn encode(&self, codec: BlockCodec) -> Vec<u8> {
        match codec {
            BlockCodec::Raw => {
                let mut out = Vec::with_capacity(1 + self.data.len());
                out.push(BlockCodec::Raw as u8);
                out.extend_from_slice(&self.data);
                out
            }
            BlockCodec::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(&self.data);
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(BlockCodec::Lz4 as u8);
                out.extend_from_slice(&compressed);
                out
            }
        }
    }

    pub fn label_at(&self, index: usize) -> Label {
        let off = index * 8;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    pub fn set_label(&mut self, index: usize, label: Label) {
        let off = index * 8;
        self.data[off..off + 8].copy_from_slice(&label.to_le_bytes());
    }

    pub fn count_label(&self, label: Label) -> u64 {
        let needle = label.to_le_bytes();
        self.data
            .chunks_exact(8)
            .filter(|chunk| *chunk == needle)
            .count() as u64
    }

    pub fn contains_label(&self, label: Label) -> bool {
        let needle = label.to_le_bytes();
        self.data.chunks_exact(8).any(|chunk| chunk == needle)
    }

    /// Distinct labels and their voxel counts.
    pub fn counts(&self) -> BTreeMap<Label, u64> {
        let mut counts = BTreeMap::new();
        for chunk in self.data.chunks_exact(8) {
            let label = u64::from_le_bytes(chunk.try_into().unwrap());
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }

    /// Rewrites every voxel whose label is in `merged` to `target`. Returns
    /// the number of voxels changed.
    pub fn merge_set(&mut self, target: Label, merged: &LabelSet) -> u64 {
        let target_bytes = target.to_le_bytes();
        let mut changed = 0u64;
        for chunk in self.data.chunks_exact_mut(8) {
            let label = u64::from_le_bytes(chunk.try_into().unwrap());
            if merged.contains(&label) {
                chunk.copy_from_slice(&target_bytes);
                changed += 1;
            }
        }
        changed
    }

    /// Rewrites every `from` voxel to `to`. Returns the voxels changed.
    pub fn replace_label(&mut self, from: Label, to: Label) -> u64 {
        let from_bytes = from.to_le_bytes();
        let to_bytes = to.to_le_bytes();
        let mut changed = 0u64;
        for chunk in self.data.chunks_exact_mut(8) {
            if chunk == from_bytes {
                chunk.copy_from_slice(&to_bytes);
                changed += 1;
            }
        }
        changed
    }

    /// Relabels the voxels covered by `rles` (absolute coordinates, already
    /// clipped to this block) to `new_label`, then reports whether any voxel
    /// of `old_label` is left in the block.
    pub fn split_fine(
        &mut self,
        coord: BlockCoord,
        rles: &[Rle],
        old_label: Label,
        new_label: Label,
    ) -> Result<FineSplitOutcome> {
        let nx = self.size.nx;
        let ny = self.size.ny;
        let nz = self.size.nz;
        let off_x = coord.x * nx;
        let off_y = coord.y * ny;
        let off_z = coord.z * nz;
        let mut relabeled = 0u64;
        for rle in rles {
            let lx = rle.start.x - off_x;
            let ly = rle.start.y - off_y;
            let lz = rle.start.z - off_z;
            if lx < 0
                || ly < 0
                || lz < 0
                || ly >= ny
                || lz >= nz
                || lx + rle.length > nx
            {
                return Err(StrataError::Invalid("RLE run outside block bounds"));
            }
            let mut index = ((lz * ny + ly) * nx + lx) as usize;
            for _ in 0..rle.length {
                self.set_label(index, new_label);
                relabeled += 1;
                index += 1;
            }
        }
        Ok(FineSplitOutcome {
            relabeled,
            old_remains: self.contains_label(old_label),
        })
    }
}
