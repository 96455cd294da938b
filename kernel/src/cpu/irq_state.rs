// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

// Interrupt-enable flag of the executing CPU. A freestanding build wires
// these raw operations to the platform's interrupt masking instructions;
// on a hosted test target each thread stands in for one CPU.
#[cfg(not(test))]
static IRQ_FLAG: AtomicBool = AtomicBool::new(true);

#[cfg(test)]
std::thread_local! {
    static IRQ_FLAG: AtomicBool = const { AtomicBool::new(true) };
}

fn irq_flag_store(val: bool) {
    #[cfg(not(test))]
    IRQ_FLAG.store(val, Ordering::Relaxed);
    #[cfg(test)]
    IRQ_FLAG.with(|f| f.store(val, Ordering::Relaxed));
}

fn irq_flag_load() -> bool {
    #[cfg(not(test))]
    {
        IRQ_FLAG.load(Ordering::Relaxed)
    }
    #[cfg(test)]
    {
        IRQ_FLAG.with(|f| f.load(Ordering::Relaxed))
    }
}

/// Unconditionally disable IRQs
///
/// Callers need to take care of re-enabling IRQs.
pub fn raw_irqs_disable() {
    irq_flag_store(false);
}

/// Unconditionally enable IRQs
///
/// Callers need to make sure it is safe to enable IRQs, e.g. that no data
/// structures or locks which are accessed in IRQ handlers are used after
/// IRQs have been enabled.
pub fn raw_irqs_enable() {
    irq_flag_store(true);
}

/// Query IRQ state on current CPU
///
/// # Returns
///
/// `true` when IRQs are enabled, `false` otherwise
#[must_use = "Unused irqs_enabled() result - meant to be irq_enable()?"]
pub fn irqs_enabled() -> bool {
    irq_flag_load()
}

/// Query IRQ state on current CPU
///
/// # Returns
///
/// `false` when IRQs are enabled, `true` otherwise
#[must_use = "Unused irqs_disabled() result - meant to be irq_disable()?"]
pub fn irqs_disabled() -> bool {
    !irqs_enabled()
}

/// This structure keeps track of the IRQ-disable nesting level of the
/// executing CPU and of whether IRQs were enabled when the outermost
/// critical section was entered. The disabled state is restored when the
/// nesting level drops back to zero.
#[derive(Debug, Default)]
pub struct IrqState {
    /// IRQ state when count was `0`
    state: AtomicBool,
    /// IRQ-disable nesting level
    count: AtomicIsize,
}

impl IrqState {
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
            count: AtomicIsize::new(0),
        }
    }

    /// Increase IRQ-disable nesting level by 1. Records the previous
    /// interrupt flag at the outermost level.
    pub fn push_nesting(&self, was_enabled: bool) {
        debug_assert!(irqs_disabled());
        let val = self.count.fetch_add(1, Ordering::Relaxed);

        assert!(val >= 0);

        if val == 0 {
            self.state.store(was_enabled, Ordering::Relaxed);
        }
    }

    /// Disables IRQs on the executing CPU and increases the nesting level.
    pub fn disable(&self) {
        let state = irqs_enabled();

        raw_irqs_disable();
        self.push_nesting(state);
    }

    /// Decrease IRQ-disable nesting level by 1.
    ///
    /// # Returns
    ///
    /// Whether IRQs were enabled when the outermost critical section was
    /// entered.
    pub fn pop_nesting(&self) -> bool {
        debug_assert!(irqs_disabled());
        let val = self.count.fetch_sub(1, Ordering::Relaxed);

        assert!(val > 0);

        if val == 1 {
            self.state.load(Ordering::Relaxed)
        } else {
            false
        }
    }

    /// Reduces the nesting level and re-enables IRQs on the executing CPU
    /// when the level reaches zero and IRQs were enabled before.
    pub fn enable(&self) {
        if self.pop_nesting() {
            raw_irqs_enable();
        }
    }

    /// Returns the current nesting level
    pub fn count(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Drop for IrqState {
    /// Make sure the IRQ-disable nesting count is 0 when the object is
    /// destroyed.
    fn drop(&mut self) {
        assert_eq!(self.count(), 0);
    }
}

#[cfg(not(test))]
static CPU_IRQ_STATE: IrqState = IrqState::new();

#[cfg(test)]
std::thread_local! {
    static CPU_IRQ_STATE: IrqState = IrqState::new();
}

fn with_irq_state<R>(f: impl FnOnce(&IrqState) -> R) -> R {
    #[cfg(not(test))]
    {
        f(&CPU_IRQ_STATE)
    }
    #[cfg(test)]
    {
        CPU_IRQ_STATE.with(|s| f(s))
    }
}

/// Disables IRQs on the executing CPU, tracking the nesting level.
pub fn irqs_disable() {
    with_irq_state(|s| s.disable());
}

/// Reduces the IRQ-disable nesting level of the executing CPU, re-enabling
/// IRQs when the level reaches zero and they were enabled before.
pub fn irqs_enable() {
    with_irq_state(|s| s.enable());
}

/// Returns the IRQ-disable nesting level of the executing CPU.
pub fn irq_nesting_count() -> isize {
    with_irq_state(|s| s.count())
}

/// Guard which disables IRQs on the executing CPU as long as it is alive.
#[derive(Debug, Default)]
#[must_use = "if unused IRQs will be immediately re-enabled"]
pub struct IrqGuard(PhantomData<*const ()>);

impl IrqGuard {
    pub fn new() -> Self {
        irqs_disable();
        Self(PhantomData)
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        irqs_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_enable_disable() {
        assert!(irqs_enabled());
        irqs_disable();
        assert!(irqs_disabled());
        irqs_enable();
        assert!(irqs_enabled());
    }

    #[test]
    fn irq_nesting() {
        assert_eq!(irq_nesting_count(), 0);
        irqs_disable();
        irqs_disable();
        assert_eq!(irq_nesting_count(), 2);
        irqs_enable();
        assert!(irqs_disabled());
        irqs_enable();
        assert!(irqs_enabled());
        assert_eq!(irq_nesting_count(), 0);
    }

    #[test]
    fn irq_guard_test() {
        assert!(irqs_enabled());
        let g1 = IrqGuard::new();
        assert!(irqs_disabled());
        drop(g1);
        assert!(irqs_enabled());
    }
}
