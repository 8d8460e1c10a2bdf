// x86_64 Platform Hooks
//
// Registers the real implementations of the `CpuOps` table on x86_64 using
// the `x86_64` crate for control registers, TLB maintenance and interrupt
// control, plus a small assembly routine for the register-file swap.
//
// Context switch layout:
// - The routine stores callee-saved registers, the post-return stack
//   pointer, the return address (as RIP), RFLAGS and CR3 into the outgoing
//   `CpuContext`, using the field offsets of its `repr(C)` layout
// - The incoming context's CR3 is loaded only when it differs from the
//   active one, avoiding a needless TLB flush between kernel contexts
// - A freshly seeded context resumes at its entry point with RDI cleared
//   and RFLAGS taken from the context (IF set for new processes)
//
// Correctness and safety notes:
// - The assembly is only emitted for bare-metal builds; hosted builds keep
//   the no-op switch so unit tests never touch real registers
// - Callers must run with interrupts disabled (see `sched::ContextSwitch`)

use ::x86_64::instructions::{hlt, interrupts, tlb};
use ::x86_64::registers::control::{Cr3, Cr3Flags};
use ::x86_64::structures::paging::PhysFrame;
use ::x86_64::{PhysAddr, VirtAddr};

use super::CpuOps;
use crate::context::CpuContext;

fn flush_page(va: usize) {
    tlb::flush(VirtAddr::new_truncate(va as u64));
}

fn load_root(root: usize) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root as u64));
    // SAFETY: callers only pass roots built by `mm::addrspace`, whose kernel
    // half mirrors the running kernel's mappings.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

fn active_root() -> usize {
    let (frame, _) = Cr3::read();
    frame.start_address().as_u64() as usize
}

fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

fn disable_interrupts() {
    interrupts::disable();
}

fn enable_interrupts() {
    interrupts::enable();
}

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global nucleus_context_switch",
    "nucleus_context_switch:",
    "mov [rdi + 8], rbx",
    "mov [rdi + 48], rbp",
    "mov [rdi + 96], r12",
    "mov [rdi + 104], r13",
    "mov [rdi + 112], r14",
    "mov [rdi + 120], r15",
    "lea rax, [rsp + 8]",
    "mov [rdi + 56], rax",
    "mov rax, [rsp]",
    "mov [rdi + 128], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 136], rax",
    "mov rax, cr3",
    "mov [rdi + 160], rax",
    "mov rax, [rsi + 160]",
    "mov rcx, cr3",
    "cmp rax, rcx",
    "je 2f",
    "mov cr3, rax",
    "2:",
    "mov rbx, [rsi + 8]",
    "mov rbp, [rsi + 48]",
    "mov r12, [rsi + 96]",
    "mov r13, [rsi + 104]",
    "mov r14, [rsi + 112]",
    "mov r15, [rsi + 120]",
    "xor rdi, rdi",
    "mov rsp, [rsi + 56]",
    "push qword ptr [rsi + 136]",
    "popfq",
    "jmp qword ptr [rsi + 128]",
);

#[cfg(target_os = "none")]
extern "C" {
    fn nucleus_context_switch(save: *mut CpuContext, load: *const CpuContext);
}

#[cfg(target_os = "none")]
unsafe fn switch_context(save: *mut CpuContext, load: *const CpuContext) {
    nucleus_context_switch(save, load);
}

#[cfg(not(target_os = "none"))]
unsafe fn switch_context(_save: *mut CpuContext, _load: *const CpuContext) {}

pub fn install() {
    super::register(CpuOps {
        flush_page,
        load_root,
        active_root,
        interrupts_enabled,
        disable_interrupts,
        enable_interrupts,
        switch_context,
        halt: hlt,
    });
}
