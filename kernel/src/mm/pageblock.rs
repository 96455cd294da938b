// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::mm::alloc::AllocError;
use crate::utils::align_down;

/// Order of a pageblock, the granularity at which migratetype labels are
/// tracked. Must be smaller than the maximum buddy order so that a free
/// block can span more than one pageblock.
pub const PAGEBLOCK_ORDER: usize = 4;

/// Number of page frames per pageblock.
pub const PAGEBLOCK_PAGES: usize = 1 << PAGEBLOCK_ORDER;

/// Bits used per pageblock in the migratetype map.
pub const PAGEBLOCK_MT_BITS: u64 = 4;

/// Mask for a single pageblock entry in the migratetype map.
pub const PAGEBLOCK_MT_MASK: u64 = (1 << PAGEBLOCK_MT_BITS) - 1;

/// Number of pageblock entries stored in one `u64` map word.
pub const PAGEBLOCKS_PER_WORD: usize = (u64::BITS as usize) / (PAGEBLOCK_MT_BITS as usize);

/// Number of migratetypes, including [`MigrateType::Isolate`].
pub const MIGRATE_TYPES: usize = 5;

/// Mobility class of a page or pageblock. Free pages carry the class of
/// the free list they sit on; pageblocks carry a label which directs
/// where pages freed within them are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateType {
    /// Allocations which cannot be relocated
    Unmovable = 0,
    /// Allocations which can be migrated to another frame
    Movable = 1,
    /// Allocations which can be freed under pressure
    Reclaimable = 2,
    /// Frames set aside for contiguous allocation
    Cma = 3,
    /// Frames withdrawn from allocation service
    Isolate = 4,
}

impl MigrateType {
    /// Lists searched, in order, when an allocation cannot be satisfied
    /// from its own list. The isolate list is never eligible.
    pub const FALLBACKS: [Self; 4] = [
        Self::Movable,
        Self::Unmovable,
        Self::Reclaimable,
        Self::Cma,
    ];

    /// Whether allocations of this class can be migrated off their frame.
    pub fn is_movable(self) -> bool {
        matches!(self, Self::Movable | Self::Cma)
    }
}

impl TryFrom<u64> for MigrateType {
    type Error = AllocError;

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        match val {
            v if v == Self::Unmovable as u64 => Ok(Self::Unmovable),
            v if v == Self::Movable as u64 => Ok(Self::Movable),
            v if v == Self::Reclaimable as u64 => Ok(Self::Reclaimable),
            v if v == Self::Cma as u64 => Ok(Self::Cma),
            v if v == Self::Isolate as u64 => Ok(Self::Isolate),
            _ => Err(AllocError::InvalidMigrateType),
        }
    }
}

/// Returns the index of the pageblock containing `pfn`.
pub fn pageblock(pfn: usize) -> usize {
    pfn >> PAGEBLOCK_ORDER
}

/// Returns the first frame number of the pageblock containing `pfn`.
pub fn pageblock_start(pfn: usize) -> usize {
    align_down(pfn, PAGEBLOCK_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pageblock_index() {
        assert_eq!(pageblock(0), 0);
        assert_eq!(pageblock(PAGEBLOCK_PAGES - 1), 0);
        assert_eq!(pageblock(PAGEBLOCK_PAGES), 1);
        assert_eq!(pageblock_start(PAGEBLOCK_PAGES + 3), PAGEBLOCK_PAGES);
    }

    #[test]
    fn test_migratetype_decode() {
        for mt in [
            MigrateType::Unmovable,
            MigrateType::Movable,
            MigrateType::Reclaimable,
            MigrateType::Cma,
            MigrateType::Isolate,
        ] {
            assert_eq!(MigrateType::try_from(mt as u64).unwrap(), mt);
        }
        assert!(MigrateType::try_from(7).is_err());
    }

    #[test]
    fn test_fallbacks_exclude_isolate() {
        assert!(!MigrateType::FALLBACKS.contains(&MigrateType::Isolate));
    }
}
