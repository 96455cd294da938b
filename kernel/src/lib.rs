// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

#![no_std]

#[cfg(test)]
extern crate std;

pub mod address;
pub mod cpu;
pub mod error;
pub mod locking;
pub mod mm;
pub mod types;
pub mod utils;

#[test]
fn test_nop() {}
