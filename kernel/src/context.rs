// CPU Execution Context
//
// Defines the register snapshot saved for every process when it leaves the
// CPU and restored when it resumes. The layout is shared with the assembly
// switch routine, so field order and sizes are part of the ABI.
//
// Layout (byte offsets):
// - General-purpose registers rax..r15 at 0..120, 8 bytes apart
// - rip at 128, rflags at 136
// - Segment selectors cs, ss, ds, es, fs, gs at 144..154, 2 bytes apart
// - cr3 (page-table root) at 160
//
// Correctness notes:
// - New contexts start with IF set (rflags 0x202) and kernel selectors
// - The stack pointer handed to `new` must already be 16-byte aligned

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const INITIAL_RFLAGS: u64 = 0x202;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub cr3: u64,
}

impl CpuContext {
    pub const fn zero() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            cr3: 0,
        }
    }

    /// Seeds a kernel-mode context that starts executing at `entry` on the
    /// given stack inside the address space rooted at `root`.
    pub const fn new(entry: u64, stack_pointer: u64, root: u64) -> Self {
        let mut ctx = Self::zero();
        ctx.rip = entry;
        ctx.rsp = stack_pointer;
        ctx.rflags = INITIAL_RFLAGS;
        ctx.cs = KERNEL_CODE_SELECTOR;
        ctx.ss = KERNEL_DATA_SELECTOR;
        ctx.ds = KERNEL_DATA_SELECTOR;
        ctx.es = KERNEL_DATA_SELECTOR;
        ctx.fs = KERNEL_DATA_SELECTOR;
        ctx.gs = KERNEL_DATA_SELECTOR;
        ctx.cr3 = root;
        ctx
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_switch_routine() {
        assert_eq!(offset_of!(CpuContext, rbx), 8);
        assert_eq!(offset_of!(CpuContext, rbp), 48);
        assert_eq!(offset_of!(CpuContext, rsp), 56);
        assert_eq!(offset_of!(CpuContext, r12), 96);
        assert_eq!(offset_of!(CpuContext, r15), 120);
        assert_eq!(offset_of!(CpuContext, rip), 128);
        assert_eq!(offset_of!(CpuContext, rflags), 136);
        assert_eq!(offset_of!(CpuContext, cs), 144);
        assert_eq!(offset_of!(CpuContext, gs), 154);
        assert_eq!(offset_of!(CpuContext, cr3), 160);
        assert_eq!(size_of::<CpuContext>(), 168);
    }

    #[test]
    fn new_context_uses_kernel_selectors() {
        let ctx = CpuContext::new(0x1000, 0x8000, 0x20_0000);
        assert_eq!(ctx.rip, 0x1000);
        assert_eq!(ctx.rsp, 0x8000);
        assert_eq!(ctx.rflags, INITIAL_RFLAGS);
        assert_eq!(ctx.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(ctx.ss, KERNEL_DATA_SELECTOR);
        assert_eq!(ctx.cr3, 0x20_0000);
    }
}
