// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

use crate::types::{PAGE_SHIFT, PAGE_SIZE};
use crate::utils::{align_down, align_up, is_aligned};
use core::fmt;
use core::ops;

pub trait Address:
    Copy + From<usize> + Into<usize> + PartialEq + Eq + PartialOrd + Ord
{
    /// Transform the address into its inner representation for easier
    /// arithmetic manipulation
    fn bits(&self) -> usize {
        (*self).into()
    }

    fn is_null(&self) -> bool {
        self.bits() == 0
    }

    fn align_up(&self, align: usize) -> Self {
        Self::from(align_up(self.bits(), align))
    }

    fn align_down(&self, align: usize) -> Self {
        Self::from(align_down(self.bits(), align))
    }

    fn page_align(&self) -> Self {
        Self::from(align_down(self.bits(), PAGE_SIZE))
    }

    fn is_aligned(&self, align: usize) -> bool {
        is_aligned(self.bits(), align)
    }

    fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    fn pfn(&self) -> usize {
        self.bits() >> PAGE_SHIFT
    }

    fn checked_add(&self, off: usize) -> Option<Self> {
        self.bits().checked_add(off).map(Self::from)
    }

    fn checked_sub(&self, off: usize) -> Option<Self> {
        self.bits().checked_sub(off).map(Self::from)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const fn new(p: usize) -> Self {
        Self(p)
    }

    pub const fn null() -> Self {
        Self(0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> PhysAddr {
        Self(addr)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

impl ops::Add<usize> for PhysAddr {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other)
    }
}

impl ops::Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    fn sub(self, other: PhysAddr) -> usize {
        self.0 - other.0
    }
}

impl Address for PhysAddr {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(v: usize) -> Self {
        Self(v)
    }

    pub const fn null() -> Self {
        Self(0)
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl<T> From<*const T> for VirtAddr {
    fn from(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

impl<T> From<*mut T> for VirtAddr {
    fn from(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }
}

impl ops::Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other)
    }
}

impl ops::Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    fn sub(self, other: VirtAddr) -> usize {
        self.0 - other.0
    }
}

impl Address for VirtAddr {}
