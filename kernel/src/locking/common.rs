// SPDX-License-Identifier: MIT
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>
use crate::cpu::IrqGuard;
use core::marker::PhantomData;

/// Abstracts interrupt state handling when taking and releasing locks.
/// There are two implemenations:
///
///   * [IrqUnsafeLocking] implements the methods as no-ops and does not
///     change any IRQ state.
///   * [IrqGuardLocking] actually disables and enables IRQs in the methods,
///     ensuring that no interrupt can be taken while the lock is held.
pub trait IrqLocking {
    /// Associated helper function to modify interrupt state when a lock is
    /// acquired. This is used by lock implementations and will return an
    /// instance of the object.
    ///
    /// # Returns
    ///
    /// New instance of implementing struct.
    fn acquire_lock() -> Self;
}

/// Implements the IRQ state handling methods as no-ops. Locks defined with
/// this state handler are not safe with respect to reentrancy due to
/// interrupt delivery.
#[derive(Debug, Default)]
pub struct IrqUnsafeLocking;

impl IrqLocking for IrqUnsafeLocking {
    fn acquire_lock() -> Self {
        Self {}
    }
}

/// Implements the state handling methods for locks that disable interrupts.
#[derive(Debug, Default)]
pub struct IrqGuardLocking {
    /// IrqGuard to keep track of IRQ state. IrqGuard implements Drop, which
    /// will re-enable IRQs when the struct goes out of scope.
    _guard: IrqGuard,
    /// Make type explicitly !Send + !Sync
    phantom: PhantomData<*const ()>,
}

impl IrqLocking for IrqGuardLocking {
    fn acquire_lock() -> Self {
        Self {
            _guard: IrqGuard::new(),
            phantom: PhantomData,
        }
    }
}
