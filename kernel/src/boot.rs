// Boot Handshake
//
// Data handed from the platform boot stub to the kernel core. Nothing here
// knows about firmware: the stub translates whatever its firmware reports
// into a flat list of memory regions plus the few addresses the memory
// manager needs to take over paging.
//
// Contents:
// - `MemoryKind` and `MemoryRegion`, one entry per physical range
// - `BootInfo`, the `#[repr(C)]` block the stub fills in (region array,
//   physical-memory offset, active root table, CPU count)

use core::slice;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Usable = 0,
    Reserved = 1,
    AcpiReclaimable = 2,
    Bootloader = 3,
    KernelImage = 4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub size: usize,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    pub const fn new(base: usize, size: usize, kind: MemoryKind) -> Self {
        Self { base, size, kind }
    }

    pub const fn usable(base: usize, size: usize) -> Self {
        Self::new(base, size, MemoryKind::Usable)
    }

    pub const fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn is_usable(&self) -> bool {
        self.kind == MemoryKind::Usable
    }
}

#[repr(C)]
pub struct BootInfo {
    pub regions: *const MemoryRegion,
    pub region_count: usize,
    /// Virtual offset at which all physical memory is mapped.
    pub phys_offset: usize,
    /// Physical address of the page-table root active at hand-off.
    pub kernel_root: usize,
    pub cpu_count: usize,
}

unsafe impl Send for BootInfo {}
unsafe impl Sync for BootInfo {}

impl BootInfo {
    pub const fn empty() -> Self {
        Self {
            regions: core::ptr::null(),
            region_count: 0,
            phys_offset: 0,
            kernel_root: 0,
            cpu_count: 1,
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        if self.regions.is_null() || self.region_count == 0 {
            return &[];
        }
        // SAFETY: the boot stub guarantees the array outlives the kernel and
        // holds `region_count` initialized entries.
        unsafe { slice::from_raw_parts(self.regions, self.region_count) }
    }

    pub fn usable_bytes(&self) -> usize {
        self.regions()
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.size)
            .sum()
    }
}
