// Memory Management Subsystem
//
// Serves as the top-level owner of every memory management layer. The
// `MemoryManager` is built once from the boot memory map and then handed to
// the system context, which keeps it behind a lock.
//
// Layering (leaves first):
// - `phys`: the linear physical-memory window used to reach frame contents
// - `pmm`: bitmap physical frame allocator
// - `paging`: 4-level page-table walks under an explicit root
// - `addrspace`: kernel template space and per-process spaces
// - `vmm`: frame-backed regions of the kernel virtual window
// - `heap`: kmalloc-style allocator over one VMM-backed arena
//
// Initialization flow:
// - Frame allocator from the region list
// - Kernel template space: either the root the boot stub left active, or a
//   fresh root when none is supplied
// - The template's window PDPTs are created up front so that every process
//   space created later shares the whole VMM window
// - The kernel heap arena is carved from the VMM on bare metal
//   (`init_kernel_heap`)
//
// Correctness and safety notes:
// - Only the process manager creates and destroys process spaces and
//   regions; everything goes through this owner so frames have one home

pub mod addrspace;
pub mod heap;
pub mod paging;
pub mod phys;
pub mod pmm;
pub mod vmm;

use crate::boot::MemoryRegion;
use crate::config::{page_align_up, KernelConfig};
use crate::error::KernelResult;
use crate::log_info;

use addrspace::AddressSpace;
use paging::PageFlags;
use phys::PhysMemory;
use pmm::{FrameAllocator, FrameStats};
use vmm::{RegionAllocator, VirtualRegion, VmmStats};

const LOG_ORIGIN: &str = "mm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub frames: FrameStats,
    pub vmm: VmmStats,
    pub kernel_root: usize,
}

pub struct MemoryManager {
    frames: FrameAllocator,
    kernel_space: AddressSpace,
    regions: RegionAllocator,
}

impl MemoryManager {
    /// # Safety
    ///
    /// `phys` must expose every frame in `regions`; `boot_root`, when
    /// given, must be the active root table and no usable region may
    /// overlap memory the boot stub still uses.
    pub unsafe fn new(
        phys: PhysMemory,
        regions: &[MemoryRegion],
        config: &KernelConfig,
        boot_root: Option<usize>,
    ) -> KernelResult<Self> {
        let mut frames = FrameAllocator::new(phys, regions)?;

        let mut kernel_space = match boot_root {
            Some(root) => AddressSpace::adopt(root),
            None => AddressSpace::new_template(&mut frames)?,
        };
        kernel_space.ensure_kernel_tables(&mut frames, config.vmm_base, config.vmm_size)?;

        log_info!(
            LOG_ORIGIN,
            "Memory manager ready: {} free frames, kernel root {:#x}, window {:#x}+{:#x}",
            frames.free_count(),
            kernel_space.root(),
            config.vmm_base,
            config.vmm_size
        );

        Ok(Self {
            frames,
            kernel_space,
            regions: RegionAllocator::new(config.vmm_base, config.vmm_size),
        })
    }

    pub fn phys(&self) -> PhysMemory {
        self.frames.phys()
    }

    pub fn frames(&mut self) -> &mut FrameAllocator {
        &mut self.frames
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    pub fn alloc_frame(&mut self) -> KernelResult<usize> {
        self.frames.alloc_frame()
    }

    pub fn free_frame(&mut self, pa: usize) -> KernelResult<()> {
        self.frames.free_frame(pa)
    }

    pub fn vmm_alloc(&mut self, size: usize, flags: PageFlags) -> KernelResult<usize> {
        self.regions
            .alloc(&mut self.frames, &mut self.kernel_space, size, flags)
    }

    pub fn vmm_map(&mut self, phys: usize, size: usize, flags: PageFlags) -> KernelResult<usize> {
        self.regions
            .map(&mut self.frames, &mut self.kernel_space, phys, size, flags)
    }

    pub fn vmm_free(&mut self, ptr: usize) -> KernelResult<()> {
        self.regions
            .free(&mut self.frames, &mut self.kernel_space, ptr)
    }

    pub fn vmm_region(&self, addr: usize) -> Option<VirtualRegion> {
        self.regions.region(addr)
    }

    pub fn create_address_space(&mut self) -> KernelResult<AddressSpace> {
        AddressSpace::create(&mut self.frames, &self.kernel_space)
    }

    pub fn destroy_address_space(&mut self, space: AddressSpace) -> KernelResult<()> {
        space.destroy(&mut self.frames)
    }

    /// Maps a page into a process space.
    pub fn map_page(
        &mut self,
        space: &mut AddressSpace,
        va: usize,
        pa: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        space.map(&mut self.frames, va, pa, flags)
    }

    pub fn unmap_page(&mut self, space: &mut AddressSpace, va: usize) -> KernelResult<usize> {
        space.unmap(&mut self.frames, va)
    }

    pub fn switch_address_space(&self, space: &AddressSpace) {
        space.activate();
    }

    pub fn get_physical_address(&self, space: &AddressSpace, va: usize) -> usize {
        space.get_physical_address(self.phys(), va)
    }

    /// Carves the kernel heap arena out of the VMM window and hands it to
    /// the global allocator.
    pub fn init_kernel_heap(&mut self, size: usize) -> KernelResult<()> {
        let base = self.vmm_alloc(size, PageFlags::kernel_rw_nx())?;
        // SAFETY: the region was just mapped, zeroed and is owned by nobody
        // else; VMM regions are never moved.
        unsafe { heap::KERNEL_HEAP.init(base, page_align_up(size)) }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            frames: self.frames.stats(),
            vmm: self.regions.stats(),
            kernel_root: self.kernel_space.root(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{memory_manager, SimulatedRam};
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn process_space_lifecycle_balances_frames() {
        let ram = SimulatedRam::with_frames(256);
        let mut mm = memory_manager(&ram, &KernelConfig::default());
        let before = mm.stats().frames.free_frames;

        let mut space = mm.create_address_space().unwrap();
        let frame = mm.alloc_frame().unwrap();
        mm.map_page(&mut space, 0x40_0000, frame, PageFlags::USER | PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(mm.get_physical_address(&space, 0x40_0000), frame);

        assert_eq!(mm.unmap_page(&mut space, 0x40_0000), Ok(frame));
        mm.free_frame(frame).unwrap();
        mm.destroy_address_space(space).unwrap();

        assert_eq!(mm.stats().frames.free_frames, before);
    }

    #[test]
    fn vmm_regions_are_visible_in_process_spaces() {
        let ram = SimulatedRam::with_frames(256);
        let mut mm = memory_manager(&ram, &KernelConfig::default());
        let space = mm.create_address_space().unwrap();

        let base = mm.vmm_alloc(2 * PAGE_SIZE, PageFlags::kernel_rw_nx()).unwrap();
        let pa = mm.get_physical_address(mm.kernel_space(), base);
        assert_ne!(pa, 0);
        assert_eq!(mm.get_physical_address(&space, base), pa);

        mm.vmm_free(base).unwrap();
        assert_eq!(mm.get_physical_address(&space, base), 0);
    }
}
