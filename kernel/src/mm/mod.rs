// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

pub mod alloc;
pub mod page_isolation;
pub mod pageblock;

pub use alloc::{
    alloc_page_gfp, allocate_page, allocate_pages, free_page, get_page, memory_info,
    pfn_to_phys, print_memory_info, put_page, root_zone_init, set_hwpoison, AllocError,
    GfpFlags, MemInfo, Zone, MAX_ORDER,
};
pub use page_isolation::{
    alloc_migrate_target, start_isolate_page_range, test_pages_isolated,
    undo_isolate_page_range, IsolateError,
};
pub use pageblock::{MigrateType, MIGRATE_TYPES, PAGEBLOCK_ORDER, PAGEBLOCK_PAGES};
