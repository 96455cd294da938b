// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

pub mod common;
pub mod spinlock;

pub use common::{IrqGuardLocking, IrqLocking, IrqUnsafeLocking};
pub use spinlock::{LockGuard, LockGuardIrqSafe, RawLockGuard, RawSpinLock, SpinLock, SpinLockIrqSafe};
