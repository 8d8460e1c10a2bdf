// Architecture Abstraction Layer
//
// Provides the small set of privileged CPU operations the memory and
// scheduling core depends on, behind a table of function pointers that the
// platform registers once during boot.
//
// Key responsibilities:
// - Invalidate a single translation-cache entry after a remap
// - Load and read the active page-table root
// - Query, disable and restore the interrupt flag
// - Perform the register-file swap of a context switch
// - Halt the CPU when there is nothing to run
//
// Design principles:
// - Every privileged instruction is reached through `CpuOps`, never inline
// - Until `register` is called the operations are no-ops, so the core runs
//   unchanged in early boot and in host unit tests
// - `CpuOps` is write-once (`spin::Once`); hooks never change after boot
//
// Correctness and safety notes:
// - `switch_context` is `unsafe`: both context pointers must stay valid for
//   the whole call and the caller must hold interrupts disabled
// - `InterruptGuard` restores the previous interrupt state, so guards nest

use spin::Once;

use crate::context::CpuContext;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[derive(Clone, Copy)]
pub struct CpuOps {
    pub flush_page: fn(usize),
    pub load_root: fn(usize),
    pub active_root: fn() -> usize,
    pub interrupts_enabled: fn() -> bool,
    pub disable_interrupts: fn(),
    pub enable_interrupts: fn(),
    pub switch_context: unsafe fn(*mut CpuContext, *const CpuContext),
    pub halt: fn(),
}

fn nop_flush(_va: usize) {}
fn nop_load_root(_root: usize) {}
fn nop_active_root() -> usize {
    0
}
fn nop_interrupts_enabled() -> bool {
    false
}
fn nop() {}
unsafe fn nop_switch(_save: *mut CpuContext, _load: *const CpuContext) {}
fn spin_halt() {
    core::hint::spin_loop();
}

const NOP_OPS: CpuOps = CpuOps {
    flush_page: nop_flush,
    load_root: nop_load_root,
    active_root: nop_active_root,
    interrupts_enabled: nop_interrupts_enabled,
    disable_interrupts: nop,
    enable_interrupts: nop,
    switch_context: nop_switch,
    halt: spin_halt,
};

static CPU_OPS: Once<CpuOps> = Once::new();

/// Installs the platform's privileged operations. Only the first call wins.
pub fn register(ops: CpuOps) {
    CPU_OPS.call_once(|| ops);
}

#[inline]
fn ops() -> &'static CpuOps {
    CPU_OPS.get().unwrap_or(&NOP_OPS)
}

#[inline]
pub fn flush_page(va: usize) {
    (ops().flush_page)(va)
}

#[inline]
pub fn load_root(root: usize) {
    (ops().load_root)(root)
}

#[inline]
pub fn active_root() -> usize {
    (ops().active_root)()
}

#[inline]
pub fn interrupts_enabled() -> bool {
    (ops().interrupts_enabled)()
}

/// Turns interrupts on unconditionally; used once boot is complete.
#[inline]
pub fn enable_interrupts() {
    (ops().enable_interrupts)()
}

#[inline]
pub fn halt() {
    (ops().halt)()
}

/// Saves the running register file into `save` and resumes `load`.
///
/// # Safety
///
/// Both pointers must reference live contexts for the duration of the call,
/// `load` must describe a resumable context, and interrupts must be disabled.
#[inline]
pub unsafe fn switch_context(save: *mut CpuContext, load: *const CpuContext) {
    (ops().switch_context)(save, load)
}

/// Disables interrupts for its lifetime and restores the previous state on drop.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = interrupts_enabled();
        if was_enabled {
            (ops().disable_interrupts)();
        }
        Self { was_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            (ops().enable_interrupts)();
        }
    }
}

#[inline(always)]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = InterruptGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_hooks_are_harmless() {
        flush_page(0xFFFF_C000_0000_0000);
        load_root(0x1000);
        assert!(!interrupts_enabled());

        let mut a = CpuContext::zero();
        let b = CpuContext::zero();
        unsafe { switch_context(&mut a, &b) };
    }

    #[test]
    fn without_interrupts_returns_closure_value() {
        assert_eq!(without_interrupts(|| 41 + 1), 42);
    }
}
