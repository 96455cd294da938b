// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{PhysAddr, VirtAddr};
use crate::error::PmmError;
use crate::locking::SpinLockIrqSafe;
use crate::mm::pageblock::{
    pageblock, MigrateType, MIGRATE_TYPES, PAGEBLOCKS_PER_WORD, PAGEBLOCK_MT_BITS,
    PAGEBLOCK_MT_MASK, PAGEBLOCK_PAGES,
};
use crate::types::PAGE_SIZE;
use crate::utils::{align_down, align_up};
use bitflags::bitflags;
use core::mem::size_of;

#[cfg(test)]
use crate::address::Address;
#[cfg(test)]
use crate::locking::{LockGuard, SpinLock};
#[cfg(test)]
use core::alloc::Layout;

/// Maximum allocation order. Up to `2^(MAX_ORDER - 1)` pages can be
/// allocated at once.
pub const MAX_ORDER: usize = 6;

bitflags! {
    /// Context flags for allocations made on behalf of users.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// Allocation is charged to a user context
        const USER = 1 << 0;
        /// The owner can relocate the allocation to another frame
        const MOVABLE = 1 << 1;
        /// The frame may come from the high memory region
        const HIGHMEM = 1 << 2;
    }
}

/// Page allocation error type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No free pages left on the eligible free lists
    OutOfMemory,
    /// Metadata does not decode to a known page type
    InvalidPageType,
    /// Value does not decode to a known migratetype
    InvalidMigrateType,
    /// Invalid page frame number
    InvalidPfn(usize),
    /// Invalid page order
    InvalidPageOrder(usize),
}

/// Page types and the meaning of their per-page payload:
///
/// * Free:      pfn of the next page on the same free list, or 0
/// * Allocated: reference count of the allocation
/// * Compound:  all pages of an allocation or free block except the first
/// * Hole:      no physical frame backs this page number
/// * Reserved:  the frame holds allocator metadata and is never handed out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageType {
    Free = 0,
    Allocated = 1,
    Compound = 2,
    Hole = 3,
    Reserved = 15,
}

impl TryFrom<u64> for PageType {
    type Error = AllocError;

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        match val {
            v if v == Self::Free as u64 => Ok(Self::Free),
            v if v == Self::Allocated as u64 => Ok(Self::Allocated),
            v if v == Self::Compound as u64 => Ok(Self::Compound),
            v if v == Self::Hole as u64 => Ok(Self::Hole),
            v if v == Self::Reserved as u64 => Ok(Self::Reserved),
            _ => Err(AllocError::InvalidPageType),
        }
    }
}

/// Encoded per-page metadata word. Stored in an array at the beginning of
/// the memory region, one word per page frame.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
struct PageStorageType(u64);

impl PageStorageType {
    const TYPE_MASK: u64 = 0xf;
    const ORDER_SHIFT: u64 = 4;
    const ORDER_MASK: u64 = 0xf;
    const MT_SHIFT: u64 = 8;
    const MT_MASK: u64 = 0x7;
    const POISON_SHIFT: u64 = 11;
    const PAYLOAD_SHIFT: u64 = 12;

    const fn new(t: PageType) -> Self {
        Self(t as u64)
    }

    fn encode_order(self, order: usize) -> Self {
        Self(self.0 | ((order as u64) << Self::ORDER_SHIFT))
    }

    fn encode_migratetype(self, mt: MigrateType) -> Self {
        Self(self.0 | ((mt as u64) << Self::MT_SHIFT))
    }

    fn encode_poison(self, poisoned: bool) -> Self {
        Self(self.0 | ((poisoned as u64) << Self::POISON_SHIFT))
    }

    fn encode_next(self, next_page: usize) -> Self {
        Self(self.0 | ((next_page as u64) << Self::PAYLOAD_SHIFT))
    }

    fn encode_refcount(self, refcount: u64) -> Self {
        Self(self.0 | (refcount << Self::PAYLOAD_SHIFT))
    }

    fn decode_order(&self) -> usize {
        ((self.0 >> Self::ORDER_SHIFT) & Self::ORDER_MASK) as usize
    }

    fn decode_migratetype(&self) -> MigrateType {
        MigrateType::try_from((self.0 >> Self::MT_SHIFT) & Self::MT_MASK)
            .expect("Invalid migratetype in page metadata")
    }

    fn decode_poison(&self) -> bool {
        (self.0 >> Self::POISON_SHIFT) & 1 == 1
    }

    fn decode_next(&self) -> usize {
        (self.0 >> Self::PAYLOAD_SHIFT) as usize
    }

    fn decode_refcount(&self) -> u64 {
        self.0 >> Self::PAYLOAD_SHIFT
    }

    fn page_type(&self) -> Result<PageType, AllocError> {
        PageType::try_from(self.0 & Self::TYPE_MASK)
    }
}

/// Metadata of a free page at the head of a free block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeInfo {
    /// Next page on the same free list, 0 terminates the list. Page
    /// frame 0 always holds metadata, so it can never appear on a list.
    pub(crate) next_page: usize,
    /// Order of the free block starting here
    pub(crate) order: usize,
    /// Free list this block sits on
    pub(crate) migratetype: MigrateType,
}

impl FreeInfo {
    fn encode(&self) -> PageStorageType {
        PageStorageType::new(PageType::Free)
            .encode_order(self.order)
            .encode_migratetype(self.migratetype)
            .encode_next(self.next_page)
    }

    fn decode(mem: PageStorageType) -> Self {
        Self {
            next_page: mem.decode_next(),
            order: mem.decode_order(),
            migratetype: mem.decode_migratetype(),
        }
    }
}

/// Metadata of an allocated page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocatedInfo {
    /// Order of the allocation starting here
    pub(crate) order: usize,
    /// Migratetype the allocation was requested with. A reference count
    /// of zero marks a page on its way back to a free list; in that
    /// state this field carries the list the page is destined for.
    pub(crate) migratetype: MigrateType,
    /// Number of references to this allocation
    pub(crate) ref_count: u64,
    /// Frame has been marked with a hardware poison error
    pub(crate) poisoned: bool,
}

impl AllocatedInfo {
    fn encode(&self) -> PageStorageType {
        PageStorageType::new(PageType::Allocated)
            .encode_order(self.order)
            .encode_migratetype(self.migratetype)
            .encode_poison(self.poisoned)
            .encode_refcount(self.ref_count)
    }

    fn decode(mem: PageStorageType) -> Self {
        Self {
            order: mem.decode_order(),
            migratetype: mem.decode_migratetype(),
            ref_count: mem.decode_refcount(),
            poisoned: mem.decode_poison(),
        }
    }
}

/// Metadata of all pages of an allocation or free block except the first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CompoundInfo {
    /// Order of the block this page belongs to
    pub(crate) order: usize,
}

impl CompoundInfo {
    fn encode(&self) -> PageStorageType {
        PageStorageType::new(PageType::Compound).encode_order(self.order)
    }

    fn decode(mem: PageStorageType) -> Self {
        Self {
            order: mem.decode_order(),
        }
    }
}

/// Metadata of a page number not backed by a physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HoleInfo;

impl HoleInfo {
    fn encode(&self) -> PageStorageType {
        PageStorageType::new(PageType::Hole)
    }
}

/// Metadata of a reserved page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReservedInfo;

impl ReservedInfo {
    fn encode(&self) -> PageStorageType {
        PageStorageType::new(PageType::Reserved)
    }
}

/// Decoded metadata of a page frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageInfo {
    Free(FreeInfo),
    Allocated(AllocatedInfo),
    Compound(CompoundInfo),
    Hole(HoleInfo),
    Reserved(ReservedInfo),
}

impl PageInfo {
    fn to_mem(self) -> PageStorageType {
        match self {
            Self::Free(fi) => fi.encode(),
            Self::Allocated(ai) => ai.encode(),
            Self::Compound(ci) => ci.encode(),
            Self::Hole(hi) => hi.encode(),
            Self::Reserved(ri) => ri.encode(),
        }
    }

    fn from_mem(mem: PageStorageType) -> Self {
        let page_type = mem.page_type().expect("Unknown page type in metadata");

        match page_type {
            PageType::Free => Self::Free(FreeInfo::decode(mem)),
            PageType::Allocated => Self::Allocated(AllocatedInfo::decode(mem)),
            PageType::Compound => Self::Compound(CompoundInfo::decode(mem)),
            PageType::Hole => Self::Hole(HoleInfo),
            PageType::Reserved => Self::Reserved(ReservedInfo),
        }
    }
}

/// Counter snapshot of the zone.
#[derive(Clone, Copy, Debug)]
pub struct MemInfo {
    /// Total number of blocks per order
    pub total_pages: [usize; MAX_ORDER],
    /// Number of free blocks per order and migratetype
    pub free_pages: [[usize; MIGRATE_TYPES]; MAX_ORDER],
    /// Number of free page frames per migratetype
    pub free_frames: [usize; MIGRATE_TYPES],
}

impl MemInfo {
    /// Total number of free page frames across all migratetypes.
    pub fn total_free_frames(&self) -> usize {
        self.free_frames.iter().sum()
    }
}

/// A contiguous zone of physical memory managed by a buddy allocator with
/// one free list per order and migratetype. The first frames of the zone
/// hold the page metadata array, followed by the pageblock migratetype
/// map, and are marked reserved.
#[derive(Debug)]
pub struct Zone {
    /// Physical start address of the zone
    start_phys: PhysAddr,
    /// Virtual start address of the zone
    start_virt: VirtAddr,
    /// Number of page frames in the zone
    page_count: usize,
    /// Number of leading frames holding metadata
    meta_pages: usize,
    /// First frame of the high memory region, `page_count` if there is
    /// none
    highmem_start: usize,
    /// Total number of blocks per order
    nr_pages: [usize; MAX_ORDER],
    /// Head of the free list per order and migratetype, 0 is the end of
    /// the list
    next_page: [[usize; MIGRATE_TYPES]; MAX_ORDER],
    /// Number of free blocks per order and migratetype
    free_pages: [[usize; MIGRATE_TYPES]; MAX_ORDER],
    /// Number of free page frames per migratetype
    free_frames: [usize; MIGRATE_TYPES],
}

impl Zone {
    pub const fn new() -> Self {
        Self {
            start_phys: PhysAddr::null(),
            start_virt: VirtAddr::null(),
            page_count: 0,
            meta_pages: 0,
            highmem_start: 0,
            nr_pages: [0; MAX_ORDER],
            next_page: [[0; MIGRATE_TYPES]; MAX_ORDER],
            free_pages: [[0; MIGRATE_TYPES]; MAX_ORDER],
            free_frames: [0; MIGRATE_TYPES],
        }
    }

    fn check_pfn(&self, pfn: usize) {
        if pfn >= self.page_count {
            panic!("Invalid Page Number {}", pfn);
        }
    }

    /// Whether a physical frame backs the given page number.
    pub(crate) fn pfn_valid(&self, pfn: usize) -> bool {
        pfn < self.page_count && !matches!(self.read_page_info(pfn), PageInfo::Hole(_))
    }

    /// Whether the frame lies in the high memory region of the zone.
    pub(crate) fn is_highmem(&self, pfn: usize) -> bool {
        pfn >= self.highmem_start
    }

    /// Returns the physical address of the given page frame.
    pub(crate) fn pfn_to_phys(&self, pfn: usize) -> PhysAddr {
        self.check_pfn(pfn);
        self.start_phys + pfn * PAGE_SIZE
    }

    fn page_info_virt_addr(&self, pfn: usize) -> VirtAddr {
        let size = size_of::<PageStorageType>();
        self.start_virt + pfn * size
    }

    fn pageblock_map_addr(&self, word: usize) -> VirtAddr {
        let map_offset = self.page_count * size_of::<PageStorageType>();
        self.start_virt + map_offset + word * size_of::<u64>()
    }

    pub(crate) fn write_page_info(&mut self, pfn: usize, pi: PageInfo) {
        self.check_pfn(pfn);

        let info = pi.to_mem();
        // SAFETY: check_pfn() above ensured the index is within the
        // metadata array.
        unsafe {
            let ptr = self
                .page_info_virt_addr(pfn)
                .as_mut_ptr::<PageStorageType>();
            ptr.write(info);
        }
    }

    pub(crate) fn read_page_info(&self, pfn: usize) -> PageInfo {
        self.check_pfn(pfn);

        // SAFETY: check_pfn() above ensured the index is within the
        // metadata array.
        let mem = unsafe { self.page_info_virt_addr(pfn).as_ptr::<PageStorageType>().read() };

        PageInfo::from_mem(mem)
    }

    /// Reads the migratetype label of the pageblock containing `pfn`.
    pub(crate) fn pageblock_migratetype(&self, pfn: usize) -> MigrateType {
        self.check_pfn(pfn);

        let block = pageblock(pfn);
        let shift = ((block % PAGEBLOCKS_PER_WORD) as u64) * PAGEBLOCK_MT_BITS;
        // SAFETY: check_pfn() above ensured the map word is within the
        // metadata area.
        let word = unsafe { self.pageblock_map_addr(block / PAGEBLOCKS_PER_WORD).as_ptr::<u64>().read() };

        MigrateType::try_from((word >> shift) & PAGEBLOCK_MT_MASK)
            .expect("Invalid migratetype in pageblock map")
    }

    /// Sets the migratetype label of the pageblock containing `pfn`. The
    /// label only directs where pages freed in the block are placed; free
    /// lists are not touched.
    pub(crate) fn set_pageblock_migratetype(&mut self, pfn: usize, mt: MigrateType) {
        self.check_pfn(pfn);

        let block = pageblock(pfn);
        let shift = ((block % PAGEBLOCKS_PER_WORD) as u64) * PAGEBLOCK_MT_BITS;
        // SAFETY: check_pfn() above ensured the map word is within the
        // metadata area.
        unsafe {
            let ptr = self
                .pageblock_map_addr(block / PAGEBLOCKS_PER_WORD)
                .as_mut_ptr::<u64>();
            let mut word = ptr.read();
            word &= !(PAGEBLOCK_MT_MASK << shift);
            word |= (mt as u64) << shift;
            ptr.write(word);
        }
    }

    /// Pushes a free block to the head of a free list and stamps its head
    /// page with the list's migratetype.
    fn free_list_push(&mut self, pfn: usize, order: usize, mt: MigrateType) {
        let idx = mt as usize;
        let old_head = self.next_page[order][idx];

        self.write_page_info(
            pfn,
            PageInfo::Free(FreeInfo {
                next_page: old_head,
                order,
                migratetype: mt,
            }),
        );
        self.next_page[order][idx] = pfn;
        self.free_pages[order][idx] += 1;
        self.free_frames[idx] += 1 << order;
    }

    /// Pops the first block off a free list. The metadata of the returned
    /// head page is stale until the caller rewrites it.
    fn free_list_pop(&mut self, order: usize, mt: MigrateType) -> Result<usize, AllocError> {
        let idx = mt as usize;
        let pfn = self.next_page[order][idx];

        if pfn == 0 {
            return Err(AllocError::OutOfMemory);
        }

        let PageInfo::Free(fi) = self.read_page_info(pfn) else {
            panic!("Unexpected page type in free-list for order {}", order);
        };

        self.next_page[order][idx] = fi.next_page;
        self.free_pages[order][idx] -= 1;
        self.free_frames[idx] -= 1 << order;

        Ok(pfn)
    }

    /// Removes a specific block from a free list. The metadata of the
    /// removed head page is stale until the caller rewrites it.
    fn free_list_unlink(&mut self, pfn: usize, order: usize, mt: MigrateType) {
        let idx = mt as usize;

        let PageInfo::Free(fi) = self.read_page_info(pfn) else {
            panic!("Unexpected page type in free-list for order {}", order);
        };

        if self.next_page[order][idx] == pfn {
            self.next_page[order][idx] = fi.next_page;
        } else {
            let mut current = self.next_page[order][idx];
            loop {
                if current == 0 {
                    panic!("Page {} not on free-list for order {}", pfn, order);
                }
                let PageInfo::Free(ci) = self.read_page_info(current) else {
                    panic!("Unexpected page type in free-list for order {}", order);
                };
                if ci.next_page == pfn {
                    self.write_page_info(
                        current,
                        PageInfo::Free(FreeInfo {
                            next_page: fi.next_page,
                            ..ci
                        }),
                    );
                    break;
                }
                current = ci.next_page;
            }
        }

        self.free_pages[order][idx] -= 1;
        self.free_frames[idx] -= 1 << order;
    }

    /// Marks the tail pages of a block as compound pages of the given
    /// order.
    fn mark_compound_page(&mut self, pfn: usize, order: usize) {
        let nr_pages = 1usize << order;

        for i in 1..nr_pages {
            self.write_page_info(pfn + i, PageInfo::Compound(CompoundInfo { order }));
        }
    }

    /// Splits a free block of `order` into two blocks of `order - 1` on
    /// the same free list.
    fn split_page(&mut self, pfn: usize, order: usize, mt: MigrateType) -> Result<(), AllocError> {
        if !(1..MAX_ORDER).contains(&order) {
            return Err(AllocError::InvalidPageOrder(order));
        }

        let new_order = order - 1;
        let pfn1 = pfn;
        let pfn2 = pfn + (1usize << new_order);

        self.mark_compound_page(pfn1, new_order);
        self.mark_compound_page(pfn2, new_order);
        // Push the upper half first so the lower half ends up at the
        // list head.
        self.free_list_push(pfn2, new_order, mt);
        self.free_list_push(pfn1, new_order, mt);

        self.nr_pages[order] -= 1;
        self.nr_pages[new_order] += 2;

        Ok(())
    }

    /// Makes sure the free list for `order` and `mt` is not empty by
    /// splitting larger blocks of the same migratetype as needed.
    fn refill_page_list(&mut self, order: usize, mt: MigrateType) -> Result<(), AllocError> {
        if order >= MAX_ORDER {
            return Err(AllocError::OutOfMemory);
        }

        if self.next_page[order][mt as usize] != 0 {
            return Ok(());
        }

        self.refill_page_list(order + 1, mt)?;

        let pfn = self.free_list_pop(order + 1, mt)?;

        self.split_page(pfn, order + 1, mt)
    }

    fn take_free_pages(&mut self, order: usize, mt: MigrateType) -> Result<usize, AllocError> {
        self.refill_page_list(order, mt)?;
        self.free_list_pop(order, mt)
    }

    /// Allocates a block of `2^order` page frames for the given
    /// migratetype.
    ///
    /// When the requested list and all larger blocks of that migratetype
    /// are exhausted the other lists are searched, except the isolate
    /// list, which never serves allocations.
    ///
    /// # Returns
    ///
    /// The page frame number of the first frame of the block.
    pub(crate) fn allocate_pages(
        &mut self,
        order: usize,
        mt: MigrateType,
    ) -> Result<usize, AllocError> {
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidPageOrder(order));
        }
        if mt == MigrateType::Isolate {
            return Err(AllocError::InvalidMigrateType);
        }

        let pfn = match self.take_free_pages(order, mt) {
            Ok(pfn) => pfn,
            Err(_) => MigrateType::FALLBACKS
                .into_iter()
                .filter(|&fb| fb != mt)
                .find_map(|fb| self.take_free_pages(order, fb).ok())
                .ok_or(AllocError::OutOfMemory)?,
        };

        // The allocation keeps the requested migratetype, no matter which
        // list the block was taken from.
        self.write_page_info(
            pfn,
            PageInfo::Allocated(AllocatedInfo {
                order,
                migratetype: mt,
                ref_count: 1,
                poisoned: false,
            }),
        );

        Ok(pfn)
    }

    /// Allocates a single page frame according to the given context
    /// flags.
    pub(crate) fn alloc_page_gfp(&mut self, flags: GfpFlags) -> Result<usize, AllocError> {
        let mt = if flags.contains(GfpFlags::MOVABLE) {
            MigrateType::Movable
        } else {
            MigrateType::Unmovable
        };

        self.allocate_pages(0, mt)
    }

    /// Takes an additional reference on an allocated page.
    pub(crate) fn get_page(&mut self, pfn: usize) -> Result<(), AllocError> {
        let PageInfo::Allocated(ai) = self.read_page_info(pfn) else {
            return Err(AllocError::InvalidPageType);
        };

        assert!(ai.ref_count > 0);
        self.write_page_info(
            pfn,
            PageInfo::Allocated(AllocatedInfo {
                ref_count: ai.ref_count + 1,
                ..ai
            }),
        );

        Ok(())
    }

    /// Drops a reference on an allocated page, freeing it when the count
    /// reaches zero. The free list is chosen from the pageblock label at
    /// this point, not from the migratetype of the allocation.
    pub(crate) fn put_page(&mut self, pfn: usize) -> Result<(), AllocError> {
        let PageInfo::Allocated(ai) = self.read_page_info(pfn) else {
            return Err(AllocError::InvalidPageType);
        };

        assert!(ai.ref_count > 0);
        if ai.ref_count > 1 {
            self.write_page_info(
                pfn,
                PageInfo::Allocated(AllocatedInfo {
                    ref_count: ai.ref_count - 1,
                    ..ai
                }),
            );
            return Ok(());
        }

        let mt = self.pageblock_migratetype(pfn);
        self.free_page_order(pfn, ai.order, mt);

        Ok(())
    }

    /// Frees an allocated page regardless of its reference count.
    pub(crate) fn free_page(&mut self, pfn: usize) {
        let res = self.read_page_info(pfn);

        match res {
            PageInfo::Allocated(ai) => {
                let mt = self.pageblock_migratetype(pfn);
                self.free_page_order(pfn, ai.order, mt);
            }
            _ => panic!("Unexpected page type in Zone::free_page()"),
        }
    }

    fn compound_neighbor(&self, pfn: usize, order: usize) -> Result<usize, AllocError> {
        if order >= MAX_ORDER - 1 {
            return Err(AllocError::InvalidPageOrder(order));
        }

        let buddy = pfn ^ (1usize << order);
        if buddy >= self.page_count {
            return Err(AllocError::InvalidPfn(buddy));
        }

        Ok(buddy)
    }

    fn merge_pages(
        &mut self,
        pfn1: usize,
        pfn2: usize,
        order: usize,
        mt: MigrateType,
    ) -> usize {
        let pfn = pfn1.min(pfn2);
        let new_order = order + 1;

        // Write a transient allocated head for the merged block; the
        // caller frees it right away.
        self.write_page_info(
            pfn,
            PageInfo::Allocated(AllocatedInfo {
                order: new_order,
                migratetype: mt,
                ref_count: 0,
                poisoned: false,
            }),
        );
        self.mark_compound_page(pfn, new_order);

        self.nr_pages[order] -= 2;
        self.nr_pages[new_order] += 1;

        pfn
    }

    fn try_to_merge_page(
        &mut self,
        pfn: usize,
        order: usize,
        mt: MigrateType,
    ) -> Result<usize, AllocError> {
        let neighbor = self.compound_neighbor(pfn, order)?;

        let PageInfo::Free(fi) = self.read_page_info(neighbor) else {
            return Err(AllocError::InvalidPageType);
        };

        if fi.order != order {
            return Err(AllocError::InvalidPageOrder(fi.order));
        }

        // The buddy can sit on a different list than the block being
        // freed. It is taken off its own list; the merged block goes
        // where the freeing was headed.
        self.free_list_unlink(neighbor, order, fi.migratetype);

        Ok(self.merge_pages(pfn, neighbor, order, mt))
    }

    fn free_page_order(&mut self, pfn: usize, order: usize, mt: MigrateType) {
        match self.try_to_merge_page(pfn, order, mt) {
            Err(_) => {
                self.free_list_push(pfn, order, mt);
            }
            Ok(new_pfn) => {
                self.free_page_order(new_pfn, order + 1, mt);
            }
        }
    }

    /// Moves all free blocks whose head lies in `[start_pfn, end_pfn]` to
    /// the free list of `mt`, restamping their head pages. A block whose
    /// head lies in the range is moved as a whole, even when its tail
    /// extends past `end_pfn`.
    ///
    /// # Returns
    ///
    /// The number of page frames moved.
    pub(crate) fn move_freepages(
        &mut self,
        start_pfn: usize,
        end_pfn: usize,
        mt: MigrateType,
    ) -> usize {
        let mut moved = 0;
        let mut pfn = start_pfn;

        while pfn <= end_pfn {
            if !self.pfn_valid(pfn) {
                pfn += 1;
                continue;
            }

            match self.read_page_info(pfn) {
                PageInfo::Free(fi) => {
                    self.free_list_unlink(pfn, fi.order, fi.migratetype);
                    self.free_list_push(pfn, fi.order, mt);
                    moved += 1usize << fi.order;
                    pfn += 1usize << fi.order;
                }
                _ => pfn += 1,
            }
        }

        moved
    }

    /// Moves the free blocks headed in the pageblock containing `pfn` to
    /// the free list of `mt`.
    pub(crate) fn move_freepages_block(&mut self, pfn: usize, mt: MigrateType) -> usize {
        let start = align_down(pfn, PAGEBLOCK_PAGES);
        if start >= self.page_count {
            return 0;
        }
        let end = (start + PAGEBLOCK_PAGES - 1).min(self.page_count - 1);

        self.move_freepages(start, end, mt)
    }

    /// Scans the pageblock containing `pfn` for pages that prevent it
    /// from being isolated: reserved frames and allocations which can
    /// neither be migrated nor reclaimed. Free blocks, absent frames and
    /// pages halfway through being freed are fine. With
    /// `skip_hwpoisoned` set, poisoned allocations are tolerated as well.
    pub(crate) fn has_unmovable_pages(&self, pfn: usize, skip_hwpoisoned: bool) -> bool {
        let start = align_down(pfn, PAGEBLOCK_PAGES);
        let end = (start + PAGEBLOCK_PAGES).min(self.page_count);
        let mut pfn = start;

        while pfn < end {
            if !self.pfn_valid(pfn) {
                pfn += 1;
                continue;
            }

            match self.read_page_info(pfn) {
                PageInfo::Free(fi) => pfn += 1usize << fi.order,
                PageInfo::Compound(ci) => {
                    // Tail of a block whose head lies in the previous
                    // pageblock. Judge it by its head.
                    let head = pfn & !((1usize << ci.order) - 1);
                    match self.read_page_info(head) {
                        PageInfo::Free(fi) => pfn = head + (1usize << fi.order),
                        PageInfo::Allocated(ai) => {
                            if ai.ref_count != 0
                                && !(skip_hwpoisoned && ai.poisoned)
                                && !ai.migratetype.is_movable()
                            {
                                return true;
                            }
                            pfn = head + (1usize << ai.order);
                        }
                        _ => return true,
                    }
                }
                PageInfo::Allocated(ai) => {
                    if ai.ref_count == 0 {
                        // Frame is halfway through being freed
                        pfn += 1;
                    } else if skip_hwpoisoned && ai.poisoned {
                        pfn += 1;
                    } else if ai.migratetype.is_movable() {
                        pfn += 1usize << ai.order;
                    } else {
                        return true;
                    }
                }
                PageInfo::Reserved(_) => return true,
                PageInfo::Hole(_) => pfn += 1,
            }
        }

        false
    }

    /// Returns the first page number out of the `nr_pages` frames
    /// starting at `start_pfn` that is backed by a physical frame.
    pub(crate) fn first_valid_pfn(&self, start_pfn: usize, nr_pages: usize) -> Option<usize> {
        for pfn in start_pfn..start_pfn + nr_pages {
            if pfn >= self.page_count {
                break;
            }
            if self.pfn_valid(pfn) {
                return Some(pfn);
            }
        }

        log::error!(
            "first_valid_pfn: no valid frame in [{:#x}, {:#x})",
            start_pfn,
            start_pfn + nr_pages
        );
        None
    }

    /// Marks an allocated page with a hardware poison error.
    pub(crate) fn set_hwpoison(&mut self, pfn: usize) -> Result<(), AllocError> {
        let PageInfo::Allocated(ai) = self.read_page_info(pfn) else {
            return Err(AllocError::InvalidPageType);
        };

        self.write_page_info(
            pfn,
            PageInfo::Allocated(AllocatedInfo {
                poisoned: true,
                ..ai
            }),
        );

        Ok(())
    }

    pub(crate) fn memory_info(&self) -> MemInfo {
        MemInfo {
            total_pages: self.nr_pages,
            free_pages: self.free_pages,
            free_frames: self.free_frames,
        }
    }

    fn init_memory(&mut self, pstart: PhysAddr, vstart: VirtAddr, page_count: usize) {
        let size = size_of::<PageStorageType>();
        let blocks = page_count.div_ceil(PAGEBLOCK_PAGES);
        let map_words = blocks.div_ceil(PAGEBLOCKS_PER_WORD);
        let meta_bytes = page_count * size + map_words * size_of::<u64>();
        let meta_pages = align_up(meta_bytes, PAGE_SIZE) / PAGE_SIZE;

        self.start_phys = pstart;
        self.start_virt = vstart;
        self.page_count = page_count;
        self.meta_pages = meta_pages;
        self.highmem_start = page_count;

        // Label every pageblock movable
        let mut movable_word: u64 = 0;
        for i in 0..PAGEBLOCKS_PER_WORD {
            movable_word |= (MigrateType::Movable as u64) << ((i as u64) * PAGEBLOCK_MT_BITS);
        }
        for word in 0..map_words {
            // SAFETY: the map word lies within the metadata area sized
            // above.
            unsafe {
                self.pageblock_map_addr(word).as_mut_ptr::<u64>().write(movable_word);
            }
        }

        // Mark metadata pages reserved
        for pfn in 0..meta_pages {
            self.write_page_info(pfn, PageInfo::Reserved(ReservedInfo));
        }

        // Mark all remaining pages as allocated
        for pfn in meta_pages..page_count {
            self.write_page_info(
                pfn,
                PageInfo::Allocated(AllocatedInfo {
                    order: 0,
                    migratetype: MigrateType::Movable,
                    ref_count: 0,
                    poisoned: false,
                }),
            );
        }

        // Now free all pages, as MAX_ORDER-1 blocks where alignment
        // allows it
        let alignment = 1usize << (MAX_ORDER - 1);
        let first_aligned = align_up(meta_pages, alignment).min(page_count);
        let last_aligned = align_down(page_count, alignment).max(first_aligned);

        for pfn in meta_pages..first_aligned {
            self.nr_pages[0] += 1;
            self.free_page_order(pfn, 0, MigrateType::Movable);
        }

        for pfn in (first_aligned..last_aligned).step_by(alignment) {
            self.nr_pages[MAX_ORDER - 1] += 1;
            self.free_list_push(pfn, MAX_ORDER - 1, MigrateType::Movable);
            self.mark_compound_page(pfn, MAX_ORDER - 1);
        }

        for pfn in last_aligned..page_count {
            self.nr_pages[0] += 1;
            self.free_page_order(pfn, 0, MigrateType::Movable);
        }
    }
}

impl Default for Zone {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Zone {
    /// Splits free blocks until `pfn` heads an order-0 free block.
    pub(crate) fn break_down_free_page(&mut self, pfn: usize) {
        loop {
            match self.read_page_info(pfn) {
                PageInfo::Free(fi) if fi.order == 0 => break,
                PageInfo::Free(fi) => {
                    self.free_list_unlink(pfn, fi.order, fi.migratetype);
                    self.split_page(pfn, fi.order, fi.migratetype).unwrap();
                }
                PageInfo::Compound(ci) => {
                    let head = pfn & !((1usize << ci.order) - 1);
                    let PageInfo::Free(fi) = self.read_page_info(head) else {
                        panic!("Page {} is not part of a free block", pfn);
                    };
                    self.free_list_unlink(head, fi.order, fi.migratetype);
                    self.split_page(head, fi.order, fi.migratetype).unwrap();
                }
                _ => panic!("Page {} is not free", pfn),
            }
        }
    }

    /// Takes the exact frame `pfn` off its free list and marks it as an
    /// order-0 allocation of the given migratetype.
    pub(crate) fn take_pfn(&mut self, pfn: usize, mt: MigrateType) {
        self.break_down_free_page(pfn);
        let PageInfo::Free(fi) = self.read_page_info(pfn) else {
            unreachable!();
        };
        self.free_list_unlink(pfn, 0, fi.migratetype);
        self.write_page_info(
            pfn,
            PageInfo::Allocated(AllocatedInfo {
                order: 0,
                migratetype: mt,
                ref_count: 1,
                poisoned: false,
            }),
        );
    }

    /// Turns the free frame `pfn` into a hole, as if it were absent from
    /// the memory map.
    pub(crate) fn punch_hole(&mut self, pfn: usize) {
        self.break_down_free_page(pfn);
        let PageInfo::Free(fi) = self.read_page_info(pfn) else {
            unreachable!();
        };
        self.free_list_unlink(pfn, 0, fi.migratetype);
        self.write_page_info(pfn, PageInfo::Hole(HoleInfo));
        self.nr_pages[0] -= 1;
    }

    /// Moves the free block headed at `pfn` to the list of `mt` without
    /// touching the pageblock label, reproducing the misplacement a free
    /// racing with a label change causes.
    pub(crate) fn misplace_free_page(&mut self, pfn: usize, mt: MigrateType) {
        let PageInfo::Free(fi) = self.read_page_info(pfn) else {
            panic!("Page {} is not a free head", pfn);
        };
        self.free_list_unlink(pfn, fi.order, fi.migratetype);
        self.free_list_push(pfn, fi.order, mt);
    }

    pub(crate) fn set_highmem_start(&mut self, pfn: usize) {
        self.highmem_start = pfn;
    }

    pub(crate) fn meta_pages(&self) -> usize {
        self.meta_pages
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }
}

pub(crate) static ROOT_ZONE: SpinLockIrqSafe<Zone> = SpinLockIrqSafe::new(Zone::new());

/// Initializes the root memory zone.
///
/// # Arguments
///
/// * `pstart` - physical start address of the zone
/// * `vstart` - virtual address the zone is mapped at
/// * `page_count` - number of page frames in the zone
pub fn root_zone_init(pstart: PhysAddr, vstart: VirtAddr, page_count: usize) {
    ROOT_ZONE.lock().init_memory(pstart, vstart, page_count);
}

/// Allocates a block of `2^order` page frames from the root zone.
pub fn allocate_pages(order: usize, mt: MigrateType) -> Result<usize, PmmError> {
    Ok(ROOT_ZONE.lock().allocate_pages(order, mt)?)
}

/// Allocates a single page frame from the root zone.
pub fn allocate_page(mt: MigrateType) -> Result<usize, PmmError> {
    allocate_pages(0, mt)
}

/// Allocates a single page frame according to the given context flags.
pub fn alloc_page_gfp(flags: GfpFlags) -> Result<usize, PmmError> {
    Ok(ROOT_ZONE.lock().alloc_page_gfp(flags)?)
}

/// Takes an additional reference on an allocated page.
pub fn get_page(pfn: usize) -> Result<(), PmmError> {
    Ok(ROOT_ZONE.lock().get_page(pfn)?)
}

/// Drops a reference on an allocated page, freeing it when the count
/// reaches zero.
pub fn put_page(pfn: usize) -> Result<(), PmmError> {
    Ok(ROOT_ZONE.lock().put_page(pfn)?)
}

/// Frees an allocated block of page frames.
pub fn free_page(pfn: usize) {
    ROOT_ZONE.lock().free_page(pfn);
}

/// Returns the physical address of a page frame in the root zone.
pub fn pfn_to_phys(pfn: usize) -> PhysAddr {
    ROOT_ZONE.lock().pfn_to_phys(pfn)
}

/// Marks an allocated page in the root zone with a hardware poison error.
pub fn set_hwpoison(pfn: usize) -> Result<(), PmmError> {
    Ok(ROOT_ZONE.lock().set_hwpoison(pfn)?)
}

/// Returns a counter snapshot of the root zone.
pub fn memory_info() -> MemInfo {
    ROOT_ZONE.lock().memory_info()
}

/// Prints a counter snapshot via the log subsystem.
pub fn print_memory_info(info: &MemInfo) {
    let mut frames_4k = 0;

    for order in 0..MAX_ORDER {
        let free: usize = info.free_pages[order].iter().sum();
        log::info!(
            "Order-{:02}: total blocks: {:5} free blocks: {:5}",
            order,
            info.total_pages[order],
            free
        );
        frames_4k += free * (1 << order);
    }

    log::info!("Total free frames: {}", frames_4k);
}

#[cfg(test)]
pub(crate) const DEFAULT_TEST_MEMORY_SIZE: usize = 8 * 1024 * 1024;

#[cfg(test)]
static TEST_ZONE_LOCK: SpinLock<()> = SpinLock::new(());

/// Sets up the root zone on memory obtained from the host allocator and
/// tears it down again on drop. Tests that touch the root zone hold one
/// of these for their whole runtime to serialize against each other.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct TestZone<'a>(LockGuard<'a, ()>);

#[cfg(test)]
impl TestZone<'_> {
    pub(crate) fn setup(size: usize) -> Self {
        extern crate alloc;
        use alloc::alloc::{alloc, handle_alloc_error};

        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let lock = TEST_ZONE_LOCK.lock();
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }

        let vstart = VirtAddr::from(ptr);
        // Identity mapping
        let pstart = PhysAddr::new(vstart.bits());
        root_zone_init(pstart, vstart, size / PAGE_SIZE);

        Self(lock)
    }
}

#[cfg(test)]
impl Drop for TestZone<'_> {
    fn drop(&mut self) {
        extern crate alloc;
        use alloc::alloc::dealloc;

        let mut zone = ROOT_ZONE.lock();
        let layout = Layout::from_size_align(zone.page_count * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: the region was obtained from alloc() with this layout
        // in setup().
        unsafe { dealloc(zone.start_virt.as_mut_ptr(), layout) };
        *zone = Zone::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_init() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let zone = ROOT_ZONE.lock();
        let info = zone.memory_info();
        let free = zone.page_count() - zone.meta_pages();

        assert_eq!(info.free_frames[MigrateType::Movable as usize], free);
        assert_eq!(info.total_free_frames(), free);

        // Every pageblock starts out labeled movable
        for pfn in (0..zone.page_count()).step_by(PAGEBLOCK_PAGES) {
            assert_eq!(zone.pageblock_migratetype(pfn), MigrateType::Movable);
        }
    }

    #[test]
    fn test_alloc_free_one() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let total = memory_info().total_free_frames();
        let pfn = allocate_page(MigrateType::Movable).unwrap();

        assert!(pfn >= ROOT_ZONE.lock().meta_pages());
        assert_eq!(memory_info().total_free_frames(), total - 1);
        assert_eq!(pfn_to_phys(pfn) - pfn_to_phys(0), pfn * PAGE_SIZE);

        free_page(pfn);
        assert_eq!(memory_info().total_free_frames(), total);
    }

    #[test]
    fn test_alloc_all_and_oom() {
        extern crate alloc;
        use alloc::vec::Vec;

        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let total = memory_info().total_free_frames();
        let mut pfns = Vec::new();

        while let Ok(pfn) = allocate_page(MigrateType::Movable) {
            pfns.push(pfn);
        }

        assert_eq!(pfns.len(), total);
        assert_eq!(memory_info().total_free_frames(), 0);
        assert!(allocate_page(MigrateType::Unmovable).is_err());

        for pfn in pfns {
            free_page(pfn);
        }
        assert_eq!(memory_info().total_free_frames(), total);
    }

    #[test]
    fn test_alloc_fallback() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        // All free pages sit on the movable lists; an unmovable request
        // must fall back to them.
        let pfn = allocate_page(MigrateType::Unmovable).unwrap();
        let zone = ROOT_ZONE.lock();
        let PageInfo::Allocated(ai) = zone.read_page_info(pfn) else {
            panic!("allocation did not mark the page");
        };
        assert_eq!(ai.migratetype, MigrateType::Unmovable);
        assert_eq!(ai.ref_count, 1);
        drop(zone);

        // On free the page follows the pageblock label, not the
        // allocation's migratetype.
        free_page(pfn);
        let info = memory_info();
        assert_eq!(info.free_frames[MigrateType::Unmovable as usize], 0);
    }

    #[test]
    fn test_get_put_page() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let total = memory_info().total_free_frames();
        let pfn = allocate_page(MigrateType::Movable).unwrap();

        get_page(pfn).unwrap();
        put_page(pfn).unwrap();
        // Still allocated, one reference left
        assert_eq!(memory_info().total_free_frames(), total - 1);

        put_page(pfn).unwrap();
        assert_eq!(memory_info().total_free_frames(), total);
    }

    #[test]
    fn test_allocate_isolate_rejected() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        assert_eq!(
            ROOT_ZONE.lock().allocate_pages(0, MigrateType::Isolate),
            Err(AllocError::InvalidMigrateType)
        );
    }

    #[test]
    fn test_pageblock_label_roundtrip() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let mut zone = ROOT_ZONE.lock();
        let pfn = 3 * PAGEBLOCK_PAGES;

        zone.set_pageblock_migratetype(pfn, MigrateType::Cma);
        // Every frame of the block carries the label, neighbors do not
        assert_eq!(zone.pageblock_migratetype(pfn + PAGEBLOCK_PAGES - 1), MigrateType::Cma);
        assert_eq!(zone.pageblock_migratetype(pfn - 1), MigrateType::Movable);
        assert_eq!(zone.pageblock_migratetype(pfn + PAGEBLOCK_PAGES), MigrateType::Movable);
    }

    #[test]
    fn test_move_freepages_block() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let mut zone = ROOT_ZONE.lock();
        let pfn = 4 * PAGEBLOCK_PAGES;

        let moved = zone.move_freepages_block(pfn, MigrateType::Isolate);
        assert!(moved >= PAGEBLOCK_PAGES);

        let info = zone.memory_info();
        assert_eq!(info.free_frames[MigrateType::Isolate as usize], moved);

        // Moving back restores the movable count
        let moved_back = zone.move_freepages_block(pfn, MigrateType::Movable);
        assert_eq!(moved_back, moved);
        assert_eq!(zone.memory_info().free_frames[MigrateType::Isolate as usize], 0);
    }

    #[test]
    fn test_has_unmovable_pages() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let mut zone = ROOT_ZONE.lock();

        // Pageblock 0 holds reserved metadata frames
        assert!(zone.has_unmovable_pages(0, false));

        // A block of free pages is fine
        let pfn = 2 * PAGEBLOCK_PAGES;
        assert!(!zone.has_unmovable_pages(pfn, false));

        // A movable allocation is fine, too
        zone.take_pfn(pfn + 3, MigrateType::Movable);
        assert!(!zone.has_unmovable_pages(pfn, false));

        // A pinned unmovable allocation is not
        zone.take_pfn(pfn + 5, MigrateType::Unmovable);
        assert!(zone.has_unmovable_pages(pfn, false));
    }

    #[test]
    fn test_has_unmovable_pages_hwpoison() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let pfn = 3 * PAGEBLOCK_PAGES;

        ROOT_ZONE.lock().take_pfn(pfn + 1, MigrateType::Unmovable);
        set_hwpoison(pfn + 1).unwrap();

        let zone = ROOT_ZONE.lock();
        assert!(zone.has_unmovable_pages(pfn, false));
        assert!(!zone.has_unmovable_pages(pfn, true));
    }

    #[test]
    fn test_first_valid_pfn() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let mut zone = ROOT_ZONE.lock();
        let pfn = 6 * PAGEBLOCK_PAGES;

        assert_eq!(zone.first_valid_pfn(pfn, PAGEBLOCK_PAGES), Some(pfn));

        zone.punch_hole(pfn);
        zone.punch_hole(pfn + 1);
        assert_eq!(zone.first_valid_pfn(pfn, PAGEBLOCK_PAGES), Some(pfn + 2));
    }

    #[test]
    fn test_highmem_boundary() {
        let _mem = TestZone::setup(DEFAULT_TEST_MEMORY_SIZE);

        let mut zone = ROOT_ZONE.lock();
        assert!(!zone.is_highmem(zone.page_count() - 1));

        let half = zone.page_count() / 2;
        zone.set_highmem_start(half);
        assert!(zone.is_highmem(zone.page_count() - 1));
        assert!(!zone.is_highmem(0));
    }
}
