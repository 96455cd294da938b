// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

//! Pageblock isolation.
//!
//! Isolation withdraws whole pageblocks from allocation service so a range
//! of physical memory can be vacated: the blocks are labeled
//! [`MigrateType::Isolate`], their free pages move to the isolate free
//! list, and pages freed inside them afterwards follow the label. Once
//! live allocations have been migrated off the range,
//! [`test_pages_isolated`] verifies that nothing remains behind and
//! repairs free pages that a racing free placed on the wrong list.

use crate::error::PmmError;
use crate::mm::alloc::{GfpFlags, PageInfo, Zone, ROOT_ZONE};
use crate::mm::pageblock::{pageblock_start, MigrateType, PAGEBLOCK_PAGES};
use crate::utils::is_aligned;

/// Pageblock isolation error type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolateError {
    /// A pageblock could not be withdrawn from service, or a frame was
    /// found outside isolation while verifying a range. Carries the
    /// offending frame number when the verifier identified one.
    Busy { failed_pfn: Option<usize> },
}

impl Zone {
    /// Tries to label the pageblock containing `pfn` isolated. On success
    /// the free blocks headed in it move to the isolate free list, taking
    /// them out of allocation service. Fails with `Busy` when the block
    /// contains pages that can neither be migrated nor reclaimed.
    pub(crate) fn set_migratetype_isolate(
        &mut self,
        pfn: usize,
        skip_hwpoisoned: bool,
    ) -> Result<(), IsolateError> {
        if self.has_unmovable_pages(pfn, skip_hwpoisoned) {
            return Err(IsolateError::Busy { failed_pfn: None });
        }

        self.set_pageblock_migratetype(pfn, MigrateType::Isolate);
        let moved = self.move_freepages_block(pfn, MigrateType::Isolate);

        log::debug!(
            "isolated pageblock at pfn {:#x}, moved {} free frames",
            pageblock_start(pfn),
            moved
        );

        Ok(())
    }

    /// Reverts the pageblock containing `pfn` to `migratetype`, putting
    /// its free pages back into allocation service. Does nothing unless
    /// the block is currently isolated.
    pub(crate) fn unset_migratetype_isolate(&mut self, pfn: usize, migratetype: MigrateType) {
        if self.pageblock_migratetype(pfn) != MigrateType::Isolate {
            return;
        }

        let moved = self.move_freepages_block(pfn, migratetype);
        self.set_pageblock_migratetype(pfn, migratetype);

        log::debug!(
            "unisolated pageblock at pfn {:#x} to {:?}, moved {} free frames",
            pageblock_start(pfn),
            migratetype,
            moved
        );
    }

    /// Walks `[start_pfn, end_pfn)` and checks that every present frame
    /// is accounted for by isolation: free on the isolate list, halfway
    /// through a free headed there, or, when `skip_hwpoisoned` is set,
    /// pinned by a hardware poison error. Free blocks found on the wrong
    /// list are repaired along the way.
    fn test_isolated_in_range(
        &mut self,
        start_pfn: usize,
        end_pfn: usize,
        skip_hwpoisoned: bool,
    ) -> Result<(), IsolateError> {
        let mut pfn = start_pfn;

        while pfn < end_pfn {
            if !self.pfn_valid(pfn) {
                pfn += 1;
                continue;
            }

            match self.read_page_info(pfn) {
                PageInfo::Free(fi) => {
                    if fi.migratetype != MigrateType::Isolate {
                        // The page was freed concurrently with the label
                        // change of its pageblock and went to the wrong
                        // list. The block is isolated, so no allocation
                        // can race with moving it now.
                        log::info!(
                            "fixing stray free block at pfn {:#x} (order {}, on {:?} list)",
                            pfn,
                            fi.order,
                            fi.migratetype
                        );
                        let end = pfn + (1usize << fi.order) - 1;
                        self.move_freepages(pfn, end, MigrateType::Isolate);
                    }
                    pfn += 1usize << fi.order;
                }
                PageInfo::Allocated(ai)
                    if ai.ref_count == 0 && ai.migratetype == MigrateType::Isolate =>
                {
                    // Frame is halfway through being freed and already
                    // stamped for the isolate list
                    pfn += 1;
                }
                PageInfo::Allocated(ai) if skip_hwpoisoned && ai.poisoned => {
                    // The poisoned frame sits pinned in an isolated
                    // block and cannot wander anywhere
                    pfn += 1;
                }
                info => {
                    log::warn!("range not isolated: pfn {:#x} in state {:?}", pfn, info);
                    return Err(IsolateError::Busy {
                        failed_pfn: Some(pfn),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Isolates all pageblocks of `[start_pfn, end_pfn)`. Both endpoints must
/// be pageblock aligned. On success no page in the range can be allocated
/// until [`undo_isolate_page_range`] reverts the labels.
///
/// When any pageblock cannot be isolated, the blocks already processed
/// are reverted to `migratetype` and the whole operation fails, leaving
/// the range as it was.
pub fn start_isolate_page_range(
    start_pfn: usize,
    end_pfn: usize,
    migratetype: MigrateType,
    skip_hwpoisoned: bool,
) -> Result<(), PmmError> {
    debug_assert!(is_aligned(start_pfn, PAGEBLOCK_PAGES));
    debug_assert!(is_aligned(end_pfn, PAGEBLOCK_PAGES));

    let mut pfn = start_pfn;
    while pfn < end_pfn {
        let mut zone = ROOT_ZONE.lock();
        let res = match zone.first_valid_pfn(pfn, PAGEBLOCK_PAGES) {
            Some(first) => zone.set_migratetype_isolate(first, skip_hwpoisoned),
            // Wholly absent pageblock, nothing to withdraw
            None => Ok(()),
        };
        drop(zone);

        if res.is_err() {
            log::warn!(
                "start_isolate_page_range: failed to isolate pageblock at pfn {:#x}",
                pfn
            );
            undo_isolate_page_range(start_pfn, pfn, migratetype);
            return Err(IsolateError::Busy { failed_pfn: None }.into());
        }

        pfn += PAGEBLOCK_PAGES;
    }

    Ok(())
}

/// Reverts the pageblocks of `[start_pfn, end_pfn)` to `migratetype`.
/// Both endpoints must be pageblock aligned. Blocks that are not isolated
/// are left untouched, so partial isolations can be undone safely.
pub fn undo_isolate_page_range(start_pfn: usize, end_pfn: usize, migratetype: MigrateType) {
    debug_assert!(is_aligned(start_pfn, PAGEBLOCK_PAGES));
    debug_assert!(is_aligned(end_pfn, PAGEBLOCK_PAGES));

    let mut pfn = start_pfn;
    while pfn < end_pfn {
        let mut zone = ROOT_ZONE.lock();
        if let Some(first) = zone.first_valid_pfn(pfn, PAGEBLOCK_PAGES) {
            zone.unset_migratetype_isolate(first, migratetype);
        }
        pfn += PAGEBLOCK_PAGES;
    }
}

/// Checks that `[start_pfn, end_pfn)` is fully isolated: every pageblock
/// carries the isolate label and no present frame is allocated anymore.
/// Free blocks that a racing free misplaced onto another list are moved
/// to the isolate list as they are found.
pub fn test_pages_isolated(
    start_pfn: usize,
    end_pfn: usize,
    skip_hwpoisoned: bool,
) -> Result<(), PmmError> {
    // Note: this takes the zone lock per pageblock first and once more
    // for the frame walk, so the whole check is not atomic. Callers hold
    // the range isolated, which keeps the verdict stable.
    let mut pfn = start_pfn;
    while pfn < end_pfn {
        let zone = ROOT_ZONE.lock();
        if let Some(first) = zone.first_valid_pfn(pfn, PAGEBLOCK_PAGES) {
            if zone.pageblock_migratetype(first) != MigrateType::Isolate {
                log::warn!(
                    "test_pages_isolated: pageblock at pfn {:#x} is not isolated",
                    pfn
                );
                return Err(IsolateError::Busy { failed_pfn: None }.into());
            }
        }
        pfn += PAGEBLOCK_PAGES;
    }

    ROOT_ZONE
        .lock()
        .test_isolated_in_range(start_pfn, end_pfn, skip_hwpoisoned)?;

    Ok(())
}

/// Allocates a destination frame for migrating the contents of `src_pfn`
/// off an isolated pageblock. Contents of high frames stay in the high
/// memory region.
///
/// # Returns
///
/// The page frame number of the allocated frame, or `None` when memory
/// is exhausted.
pub fn alloc_migrate_target(src_pfn: usize) -> Option<usize> {
    let mut flags = GfpFlags::USER | GfpFlags::MOVABLE;

    let mut zone = ROOT_ZONE.lock();
    if zone.is_highmem(src_pfn) {
        flags |= GfpFlags::HIGHMEM;
    }

    zone.alloc_page_gfp(flags).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::alloc::{
        allocate_page, memory_info, AllocatedInfo, TestZone, DEFAULT_TEST_MEMORY_SIZE,
    };

    const MOVABLE: usize = MigrateType::Movable as usize;
    const ISOLATE: usize = MigrateType::Isolate as usize;
    const CMA: usize = MigrateType::Cma as usize;

    #[test]
    fn test_isolate_verify_undo() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 3 * PAGEBLOCK_PAGES;

        let before = memory_info();
        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();

        {
            let zone = ROOT_ZONE.lock();
            assert_eq!(zone.pageblock_migratetype(start), MigrateType::Isolate);
            assert_eq!(zone.pageblock_migratetype(end - 1), MigrateType::Isolate);
            // Neighboring blocks keep their label
            assert_eq!(zone.pageblock_migratetype(end), MigrateType::Movable);
        }

        // Free pages moved lists but none were created or lost
        let info = memory_info();
        assert!(info.free_frames[ISOLATE] >= end - start);
        assert_eq!(info.total_free_frames(), before.total_free_frames());

        test_pages_isolated(start, end, false).unwrap();

        undo_isolate_page_range(start, end, MigrateType::Movable);
        let after = memory_info();
        assert_eq!(after.free_frames[ISOLATE], 0);
        assert_eq!(after.free_frames[MOVABLE], before.free_frames[MOVABLE]);
        assert_eq!(
            ROOT_ZONE.lock().pageblock_migratetype(start),
            MigrateType::Movable
        );
    }

    #[test]
    fn test_no_allocation_from_isolated_range() {
        extern crate alloc;
        use alloc::vec::Vec;

        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 3 * PAGEBLOCK_PAGES;

        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();

        let mut pfns = Vec::new();
        while let Ok(pfn) = allocate_page(MigrateType::Movable) {
            assert!(!(start..end).contains(&pfn));
            pfns.push(pfn);
        }

        // Allocation failed while isolated frames were still free
        assert!(memory_info().free_frames[ISOLATE] >= end - start);

        for pfn in pfns {
            crate::mm::alloc::free_page(pfn);
        }
        undo_isolate_page_range(start, end, MigrateType::Movable);
    }

    #[test]
    fn test_isolate_rollback_on_busy_block() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 4 * PAGEBLOCK_PAGES;

        // Pin an unmovable page in the last block of the range
        ROOT_ZONE
            .lock()
            .take_pfn(3 * PAGEBLOCK_PAGES + 2, MigrateType::Unmovable);

        let before = memory_info();
        assert_eq!(
            start_isolate_page_range(start, end, MigrateType::Movable, false),
            Err(PmmError::Isolate(IsolateError::Busy { failed_pfn: None }))
        );

        // All or nothing: the blocks isolated before the failure were
        // reverted
        let zone = ROOT_ZONE.lock();
        for pfn in (start..end).step_by(PAGEBLOCK_PAGES) {
            assert_eq!(zone.pageblock_migratetype(pfn), MigrateType::Movable);
        }
        let info = zone.memory_info();
        assert_eq!(info.free_frames[ISOLATE], 0);
        assert_eq!(info.free_frames[MOVABLE], before.free_frames[MOVABLE]);
    }

    #[test]
    fn test_verifier_repairs_stray_free_block() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 3 * PAGEBLOCK_PAGES;

        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();

        {
            let mut zone = ROOT_ZONE.lock();
            zone.break_down_free_page(start + 1);
            zone.misplace_free_page(start + 1, MigrateType::Movable);
        }

        let before = memory_info();
        test_pages_isolated(start, end, false).unwrap();

        // The stray page is back on the isolate list with its stamp fixed
        let zone = ROOT_ZONE.lock();
        let PageInfo::Free(fi) = zone.read_page_info(start + 1) else {
            panic!("repaired page is not free");
        };
        assert_eq!(fi.migratetype, MigrateType::Isolate);
        let info = zone.memory_info();
        assert_eq!(info.free_frames[MOVABLE], before.free_frames[MOVABLE] - 1);
        assert_eq!(info.free_frames[ISOLATE], before.free_frames[ISOLATE] + 1);
    }

    #[test]
    fn test_verifier_frame_mid_free() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 3 * PAGEBLOCK_PAGES;

        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();

        // A frame between refcount drop and free-list insert is stamped
        // with its destination list
        {
            let mut zone = ROOT_ZONE.lock();
            zone.break_down_free_page(start + 5);
            zone.write_page_info(
                start + 5,
                PageInfo::Allocated(AllocatedInfo {
                    order: 0,
                    migratetype: MigrateType::Isolate,
                    ref_count: 0,
                    poisoned: false,
                }),
            );
        }
        test_pages_isolated(start, end, false).unwrap();

        // Stamped for any other list, the frame will surface elsewhere
        {
            let mut zone = ROOT_ZONE.lock();
            zone.write_page_info(
                start + 5,
                PageInfo::Allocated(AllocatedInfo {
                    order: 0,
                    migratetype: MigrateType::Movable,
                    ref_count: 0,
                    poisoned: false,
                }),
            );
        }
        assert_eq!(
            test_pages_isolated(start, end, false),
            Err(PmmError::Isolate(IsolateError::Busy {
                failed_pfn: Some(start + 5)
            }))
        );
    }

    #[test]
    fn test_verifier_hwpoison() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = 2 * PAGEBLOCK_PAGES;
        let end = 3 * PAGEBLOCK_PAGES;
        let poisoned = start + 8;

        {
            let mut zone = ROOT_ZONE.lock();
            zone.take_pfn(poisoned, MigrateType::Movable);
            zone.set_hwpoison(poisoned).unwrap();
        }

        start_isolate_page_range(start, end, MigrateType::Movable, true).unwrap();
        test_pages_isolated(start, end, true).unwrap();
        assert_eq!(
            test_pages_isolated(start, end, false),
            Err(PmmError::Isolate(IsolateError::Busy {
                failed_pfn: Some(poisoned)
            }))
        );

        undo_isolate_page_range(start, end, MigrateType::Movable);
    }

    #[test]
    fn test_isolate_sparse_block() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = 5 * PAGEBLOCK_PAGES;
        let end = 6 * PAGEBLOCK_PAGES;

        {
            let mut zone = ROOT_ZONE.lock();
            for pfn in start..start + 4 {
                zone.punch_hole(pfn);
            }
        }

        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();
        test_pages_isolated(start, end, false).unwrap();
        undo_isolate_page_range(start, end, MigrateType::Movable);

        let zone = ROOT_ZONE.lock();
        assert_eq!(zone.pageblock_migratetype(start), MigrateType::Movable);
        assert_eq!(zone.memory_info().free_frames[ISOLATE], 0);
    }

    #[test]
    fn test_empty_range_is_noop() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let pfn = PAGEBLOCK_PAGES;

        let before = memory_info();
        start_isolate_page_range(pfn, pfn, MigrateType::Movable, false).unwrap();
        test_pages_isolated(pfn, pfn, false).unwrap();
        undo_isolate_page_range(pfn, pfn, MigrateType::Movable);

        let after = memory_info();
        assert_eq!(after.free_frames, before.free_frames);
    }

    #[test]
    fn test_undo_to_other_migratetype() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 2 * PAGEBLOCK_PAGES;

        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();
        undo_isolate_page_range(start, end, MigrateType::Cma);

        let zone = ROOT_ZONE.lock();
        assert_eq!(zone.pageblock_migratetype(start), MigrateType::Cma);
        let PageInfo::Free(fi) = zone.read_page_info(start) else {
            panic!("first frame of the block is not free");
        };
        assert_eq!(fi.migratetype, MigrateType::Cma);
        let info = zone.memory_info();
        assert_eq!(info.free_frames[ISOLATE], 0);
        assert!(info.free_frames[CMA] >= end - start);
    }

    #[test]
    fn test_undo_is_idempotent() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let start = PAGEBLOCK_PAGES;
        let end = 2 * PAGEBLOCK_PAGES;

        start_isolate_page_range(start, end, MigrateType::Movable, false).unwrap();
        undo_isolate_page_range(start, end, MigrateType::Movable);
        let info = memory_info();

        undo_isolate_page_range(start, end, MigrateType::Movable);
        let again = memory_info();
        assert_eq!(again.free_frames, info.free_frames);
    }

    #[test]
    #[should_panic]
    fn test_misaligned_range_panics() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);
        let _ = start_isolate_page_range(3, PAGEBLOCK_PAGES + 3, MigrateType::Movable, false);
    }

    #[test]
    fn test_alloc_migrate_target() {
        extern crate alloc;
        use alloc::vec::Vec;

        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let src = allocate_page(MigrateType::Movable).unwrap();
        let target = alloc_migrate_target(src).unwrap();
        {
            let zone = ROOT_ZONE.lock();
            let PageInfo::Allocated(ai) = zone.read_page_info(target) else {
                panic!("migration target is not allocated");
            };
            assert_eq!(ai.migratetype, MigrateType::Movable);
            assert_eq!(ai.ref_count, 1);
        }

        // Exhaust memory, then no target can be found
        let mut pfns = Vec::new();
        while let Ok(pfn) = allocate_page(MigrateType::Movable) {
            pfns.push(pfn);
        }
        assert!(alloc_migrate_target(src).is_none());

        for pfn in pfns {
            crate::mm::alloc::free_page(pfn);
        }
    }
}
