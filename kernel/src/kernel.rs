// Kernel core entry point and initialization
//
// This file is the crate root of the memory-management and scheduling core.
// It declares the subsystems, brings them up in a fixed order from the boot
// handshake, and publishes the resulting system context.
//
// Key responsibilities:
// - Serve as the kernel entry point after the boot stub hands over
//   (`kmain` on bare metal)
// - Initialize logging, the architecture hooks and the tick source
// - Build the memory manager from the boot region list
// - Carve the kernel heap and install it as the global allocator
// - Construct the system context (process table and scheduler)
// - Route timer interrupts and system calls into the system context
//
// Initialization order:
// - Logging and time first, so every later step can report
// - CPU hooks (TLB, CR3, context switch) before any page table is touched
// - Memory manager, then the kernel heap; nothing allocates before that
// - System context last; it is stored once and never replaced
//
// Host builds:
// - Under `cfg(test)` the crate links std and the CPU hooks stay no-ops,
//   so every subsystem runs against simulated RAM
// - The global allocator, serial output and panic handler exist only on
//   bare metal (`target_os = "none"`)
//
// Public interface:
// - `init(boot_info, config)` returns the system context
// - `system()` after initialization
// - `on_timer_interrupt(cpu)` and `on_syscall(cpu, number, args)` for the
//   architecture entry stubs

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod config;
pub mod context;
pub mod error;
pub mod ipc;
pub mod log;
pub mod mm;
pub mod process;
pub mod sched;
#[cfg(target_arch = "x86_64")]
pub mod serial;
pub mod syscall;
pub mod system;
pub mod timer;

use spin::Once;

use crate::boot::BootInfo;
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::mm::phys::PhysMemory;
use crate::mm::MemoryManager;
use crate::system::System;

const LOG_KERNEL_INIT: &str = "kernel:init";

static SYSTEM: Once<System> = Once::new();

/// Brings the core up from the boot handshake.
///
/// # Safety
///
/// `boot_info` must describe the machine truthfully: the region list must
/// only mark memory nobody else uses as usable, `phys_offset` must map all
/// of physical memory, and `kernel_root`, if non-zero, must be the active
/// root table. Must be called once, on the boot CPU.
pub unsafe fn init(boot_info: &BootInfo, config: KernelConfig) -> KernelResult<&'static System> {
    if SYSTEM.is_completed() {
        return Err(KernelError::InvalidArgument);
    }

    log::init(config.log_level);
    timer::set_frequency(config.timer_hz);

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        arch::x86_64::install();
        serial::init();
    }

    config.validate()?;
    if boot_info.cpu_count != 0 && boot_info.cpu_count < config.cpu_count {
        log_warn!(
            LOG_KERNEL_INIT,
            "Configured for {} CPUs but the boot stub reports {}",
            config.cpu_count,
            boot_info.cpu_count
        );
    }

    log_info!(
        LOG_KERNEL_INIT,
        "Boot handshake: {} regions, {} KiB usable, phys offset {:#x}",
        boot_info.regions().len(),
        boot_info.usable_bytes() / 1024,
        boot_info.phys_offset
    );

    let phys = PhysMemory::new(boot_info.phys_offset);
    let boot_root = (boot_info.kernel_root != 0).then_some(boot_info.kernel_root);
    #[allow(unused_mut)]
    let mut memory = MemoryManager::new(phys, boot_info.regions(), &config, boot_root)?;

    #[cfg(target_os = "none")]
    memory.init_kernel_heap(config.kernel_heap_size)?;

    let system = System::new(memory, config)?;
    log_info!(LOG_KERNEL_INIT, "Kernel core initialized");
    Ok(SYSTEM.call_once(|| system))
}

pub fn system() -> Option<&'static System> {
    SYSTEM.get()
}

/// Timer interrupt entry. Errors are logged; an interrupt has nobody to
/// report them to.
pub fn on_timer_interrupt(cpu: usize) {
    if let Some(system) = system() {
        if let Err(err) = system.timer_tick(cpu) {
            log_error!("timer", "Tick on cpu{} failed: {}", cpu, err);
        }
    }
}

/// System call entry. Returns ENOSYS until the system is initialized.
pub fn on_syscall(cpu: usize, number: u64, args: [u64; 6]) -> i64 {
    match system() {
        Some(system) => syscall::dispatch(system, cpu, number, args),
        None => error::ENOSYS,
    }
}

#[cfg(target_os = "none")]
#[no_mangle]
pub unsafe extern "C" fn kmain(boot_info: &'static BootInfo) -> ! {
    let cpus = boot_info.cpu_count.clamp(1, config::MAX_CPUS);
    match init(boot_info, KernelConfig::default().with_cpus(cpus)) {
        Ok(_) => arch::enable_interrupts(),
        Err(err) => log_panic!(LOG_KERNEL_INIT, "Initialization failed: {}", err),
    }
    loop {
        arch::halt();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_panic!("PANIC", "{}", info);
    loop {
        arch::halt();
    }
}
