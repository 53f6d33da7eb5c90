//! Down-resolution support for scale pyramids.
//!
//! A lo-res block covers eight hi-res blocks, one per octant. Changed hi-res
//! blocks are grouped by their lo-res parent so a pyramid builder only loads
//! the lo-res blocks it actually has to rewrite. The lo-res voxels of a
//! populated octant come from 2x subsampling of the hi-res block.

use rustc_hash::FxHashMap;

use super::LabelBlock;
use crate::error::{Result, StrataError};
use crate::model::{BlockCoord, BlockSize};

pub type OctantMap = FxHashMap<BlockCoord, [Option<LabelBlock>; 8]>;

/// Octant of a hi-res block within its lo-res parent, in [0, 7].
pub fn octant_index(coord: BlockCoord) -> usize {
    ((coord.z & 1) * 4 + (coord.y & 1) * 2 + (coord.x & 1)) as usize
}

/// The lo-res block coordinate covering a hi-res coordinate.
pub fn parent_coord(coord: BlockCoord) -> BlockCoord {
    BlockCoord::new(coord.x >> 1, coord.y >> 1, coord.z >> 1)
}

/// Groups changed hi-res blocks by lo-res parent and octant slot.
pub fn group_octants<I>(hires: I) -> OctantMap
where
    I: IntoIterator<Item = (BlockCoord, LabelBlock)>,
{
    let mut octants = OctantMap::default();
    for (coord, block) in hires {
        let parent = parent_coord(coord);
        let slot = octant_index(coord);
        let entry = octants.entry(parent).or_insert_with(Default::default);
        entry[slot] = Some(block);
    }
    octants
}

/// Rewrites the octant regions of `lores` covered by populated octants,
/// sampling the even-coordinate voxel of each 2x2x2 hi-res cell. Octants
/// left `None` keep the existing lo-res voxels.
pub fn downres_octants(
    lores: &mut LabelBlock,
    octants: &[Option<LabelBlock>; 8],
) -> Result<()> {
    let size = lores.size();
    if size.nx % 2 != 0 || size.ny % 2 != 0 || size.nz % 2 != 0 {
        return Err(StrataError::Invalid("block size must be even to downres"));
    }
    let hx = size.nx / 2;
    let hy = size.ny / 2;
    let hz = size.nz / 2;
    for (slot, octant) in octants.iter().enumerate() {
        let Some(hires) = octant else { continue };
        if hires.size() != size {
            return Err(StrataError::Invalid("octant block size mismatch"));
        }
        let ox = (slot & 1) as i32 * hx;
        let oy = ((slot >> 1) & 1) as i32 * hy;
        let oz = ((slot >> 2) & 1) as i32 * hz;
        for z in 0..hz {
            for y in 0..hy {
                for x in 0..hx {
                    let src = (((2 * z) * size.ny + 2 * y) * size.nx + 2 * x) as usize;
                    let dst = (((oz + z) * size.ny + (oy + y)) * size.nx + (ox + x)) as usize;
                    lores.set_label(dst, hires.label_at(src));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octant_index_covers_all_parities() {
        let mut seen = [false; 8];
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    let idx = octant_index(BlockCoord::new(x, y, z));
                    assert_eq!(idx, (z * 4 + y * 2 + x) as usize);
                    seen[idx] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn octant_index_handles_negative_coordinates() {
        // -1 & 1 == 1 for two's complement, so odd negatives land in the
        // high slot of their parent just like odd positives.
        assert_eq!(octant_index(BlockCoord::new(-1, -2, -3)), 5);
        assert_eq!(parent_coord(BlockCoord::new(-1, -2, -3)), BlockCoord::new(-1, -1, -2));
    }

    #[test]
    fn group_octants_places_blocks_in_slots() {
        let size = BlockSize::cube(4);
        let grouped = group_octants(vec![
            (BlockCoord::new(0, 0, 0), LabelBlock::solid(size, 1)),
            (BlockCoord::new(1, 0, 0), LabelBlock::solid(size, 2)),
            (BlockCoord::new(2, 0, 0), LabelBlock::solid(size, 3)),
        ]);
        assert_eq!(grouped.len(), 2);
        let first = &grouped[&BlockCoord::new(0, 0, 0)];
        assert!(first[0].is_some() && first[1].is_some());
        let second = &grouped[&BlockCoord::new(1, 0, 0)];
        assert!(second[0].is_some());
    }

    #[test]
    fn downres_fills_octant_region() -> Result<()> {
        let size = BlockSize::cube(4);
        let mut lores = LabelBlock::solid(size, 0);
        let mut octants: [Option<LabelBlock>; 8] = Default::default();
        octants[0] = Some(LabelBlock::solid(size, 9));
        downres_octants(&mut lores, &octants)?;
        // Octant 0 occupies the low 2x2x2 corner of the lo-res block.
        assert_eq!(lores.label_at(0), 9);
        assert_eq!(lores.count_label(9), 8);
        Ok(())
    }
}
