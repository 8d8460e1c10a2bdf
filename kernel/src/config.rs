// Kernel Configuration
//
// Central home for the tunables of the memory and scheduling core. Values
// that the hardware fixes (page size, page-table geometry) are plain
// constants; values an integrator may want to change at boot live in
// `KernelConfig`, which is validated once before any subsystem is built.
//
// Key responsibilities:
// - Define the compile-time defaults for every subsystem
// - Offer a builder-style `KernelConfig` for boot-time overrides
// - Reject nonsensical configurations before anything is allocated
//
// Correctness notes:
// - The VMM window must lie in the upper (kernel) half so that its mappings
//   are shared by every address space
// - `max_processes` includes the PID 0 slot reserved for the idle/kernel PCB

use crate::error::{KernelError, KernelResult};
use crate::log::LogLevel;
use crate::sched::SchedAlgorithm;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const ENTRIES_PER_TABLE: usize = 512;

pub const MAX_PROCESSES: usize = 256;
pub const MAX_CPUS: usize = 64;
pub const PROCESS_STACK_SIZE: usize = 8 * 1024;
pub const PROCESS_HEAP_SIZE: usize = 64 * 1024;
pub const PROCESS_NAME_MAX: usize = 32;

pub const DEFAULT_TIME_SLICE: u64 = 10;
pub const TIMER_HZ: u64 = 100;

pub const KERNEL_HEAP_SIZE: usize = 1024 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 256;

pub const VMM_WINDOW_BASE: usize = 0xFFFF_C000_0000_0000;
pub const VMM_WINDOW_SIZE: usize = 64 * 1024 * 1024 * 1024;
pub const MAX_VIRTUAL_REGIONS: usize = 1024;

const KERNEL_HALF_START: usize = 0xFFFF_8000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub cpu_count: usize,
    pub algorithm: SchedAlgorithm,
    pub time_slice: u64,
    pub timer_hz: u64,
    pub max_processes: usize,
    pub stack_size: usize,
    pub heap_size: usize,
    pub kernel_heap_size: usize,
    pub vmm_base: usize,
    pub vmm_size: usize,
    pub log_level: LogLevel,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            algorithm: SchedAlgorithm::RoundRobin,
            time_slice: DEFAULT_TIME_SLICE,
            timer_hz: TIMER_HZ,
            max_processes: MAX_PROCESSES,
            stack_size: PROCESS_STACK_SIZE,
            heap_size: PROCESS_HEAP_SIZE,
            kernel_heap_size: KERNEL_HEAP_SIZE,
            vmm_base: VMM_WINDOW_BASE,
            vmm_size: VMM_WINDOW_SIZE,
            log_level: LogLevel::Info,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    pub fn with_algorithm(mut self, algorithm: SchedAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_time_slice(mut self, ticks: u64) -> Self {
        self.time_slice = ticks;
        self
    }

    pub fn with_timer_hz(mut self, hz: u64) -> Self {
        self.timer_hz = hz;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub fn with_process_sizes(mut self, stack_size: usize, heap_size: usize) -> Self {
        self.stack_size = stack_size;
        self.heap_size = heap_size;
        self
    }

    pub fn with_kernel_heap(mut self, size: usize) -> Self {
        self.kernel_heap_size = size;
        self
    }

    pub fn with_vmm_window(mut self, base: usize, size: usize) -> Self {
        self.vmm_base = base;
        self.vmm_size = size;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(KernelError::InvalidArgument);
        }
        if self.time_slice == 0 || self.timer_hz == 0 || self.timer_hz > 1_000_000 {
            return Err(KernelError::InvalidArgument);
        }
        // Slot 0 belongs to the idle PCB, so at least one more slot is needed.
        if self.max_processes < 2 || self.max_processes > u32::MAX as usize {
            return Err(KernelError::InvalidArgument);
        }
        if self.stack_size < 16 || self.heap_size == 0 || self.kernel_heap_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.vmm_base % PAGE_SIZE != 0
            || self.vmm_size == 0
            || self.vmm_size % PAGE_SIZE != 0
            || self.vmm_base < KERNEL_HALF_START
            || self.vmm_base.checked_add(self.vmm_size - 1).is_none()
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

#[inline]
pub const fn page_align_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_values_are_rejected() {
        let cfg = KernelConfig::default().with_cpus(0);
        assert_eq!(cfg.validate(), Err(KernelError::InvalidArgument));

        let cfg = KernelConfig::default().with_time_slice(0);
        assert_eq!(cfg.validate(), Err(KernelError::InvalidArgument));

        let cfg = KernelConfig::default().with_max_processes(1);
        assert_eq!(cfg.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn vmm_window_must_be_in_kernel_half() {
        let cfg = KernelConfig::default().with_vmm_window(0x4000_0000, 0x10_0000);
        assert_eq!(cfg.validate(), Err(KernelError::InvalidArgument));

        let cfg = KernelConfig::default().with_vmm_window(VMM_WINDOW_BASE + 1, 0x10_0000);
        assert_eq!(cfg.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_align_up(0), 0);
        assert_eq!(page_align_up(1), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
        assert!(is_page_aligned(3 * PAGE_SIZE));
        assert!(!is_page_aligned(PAGE_SIZE + 8));
    }
}
