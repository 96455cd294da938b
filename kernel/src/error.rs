// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

//! High level error typing for the public API.
//!
//! This module contains the generic [`PmmError`] type, which should be
//! used everywhere by code that does not reside in a leaf module. Leaf
//! modules define their own error types, which can be converted into
//! [`PmmError`] via the `From` trait.

use crate::mm::alloc::AllocError;
use crate::mm::page_isolation::IsolateError;

/// A generic error during operation of the memory manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmmError {
    /// Errors related to page allocation
    Alloc(AllocError),
    /// Errors related to pageblock isolation
    Isolate(IsolateError),
}

impl From<AllocError> for PmmError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

impl From<IsolateError> for PmmError {
    fn from(err: IsolateError) -> Self {
        Self::Isolate(err)
    }
}
