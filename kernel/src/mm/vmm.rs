// Virtual Region Allocator
//
// Hands out page-granular regions of the kernel's virtual window and backs
// them with physical frames. Every region is recorded in a fixed extent
// table, which is what allows `free` to give both the virtual range and its
// frames back.
//
// Key responsibilities:
// - Reserve window space with a monotonically increasing cursor
// - Back each page of an allocation with a fresh zeroed frame
// - Map existing physical ranges (device buffers) without owning them
// - Release a region: unmap every page and return owned frames
//
// Design principles:
// - All-or-nothing: a failed allocation unmaps and frees everything it had
//   done and leaves the cursor and extent table unchanged
// - The extent table is a fixed array so the allocator works before the
//   kernel heap exists (the heap arena itself comes from here)
// - Freeing the topmost region rewinds the cursor; holes below it are not
//   reused
//
// Correctness and safety notes:
// - Mappings go into the kernel template space, whose window PDPTs are
//   shared with every process space
// - `free` only accepts the exact address returned by `alloc`/`map`; for a
//   mapped range that includes the sub-page offset of the physical address

use crate::config::{MAX_VIRTUAL_REGIONS, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::addrspace::AddressSpace;
use crate::mm::paging::PageFlags;
use crate::mm::pmm::FrameAllocator;
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "vmm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRegion {
    pub base: usize,
    /// Address handed back to the caller; differs from `base` only for
    /// mappings of a physical address that is not page aligned.
    pub start: usize,
    pub size: usize,
    pub flags: PageFlags,
    pub owns_frames: bool,
}

impl VirtualRegion {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmmStats {
    pub window_base: usize,
    pub window_size: usize,
    pub cursor: usize,
    pub live_regions: usize,
    pub mapped_pages: usize,
    pub allocations: u64,
    pub frees: u64,
}

pub struct RegionAllocator {
    base: usize,
    size: usize,
    cursor: usize,
    regions: [Option<VirtualRegion>; MAX_VIRTUAL_REGIONS],
    live: usize,
    mapped_pages: usize,
    allocations: u64,
    frees: u64,
}

impl RegionAllocator {
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            cursor: base,
            regions: [None; MAX_VIRTUAL_REGIONS],
            live: 0,
            mapped_pages: 0,
            allocations: 0,
            frees: 0,
        }
    }

    pub fn window(&self) -> (usize, usize) {
        (self.base, self.size)
    }

    fn reserve(&self, bytes: usize) -> KernelResult<(usize, usize)> {
        let slot = self
            .regions
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::ResourceExhausted)?;

        let end = self
            .cursor
            .checked_add(bytes)
            .ok_or(KernelError::ResourceExhausted)?;
        if end > self.base + self.size {
            return Err(KernelError::ResourceExhausted);
        }
        Ok((slot, self.cursor))
    }

    fn commit(&mut self, slot: usize, region: VirtualRegion) {
        self.regions[slot] = Some(region);
        self.cursor = region.end();
        self.live += 1;
        self.mapped_pages += region.pages();
        self.allocations += 1;
    }

    /// Allocates `size` bytes (rounded up to pages) of zeroed, frame-backed
    /// kernel memory and returns its base address.
    pub fn alloc(
        &mut self,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        size: usize,
        flags: PageFlags,
    ) -> KernelResult<usize> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let bytes = size
            .checked_add(PAGE_SIZE - 1)
            .map(|end| end & !(PAGE_SIZE - 1))
            .ok_or(KernelError::ResourceExhausted)?;
        let (slot, base) = self.reserve(bytes)?;
        let pages = bytes / PAGE_SIZE;

        for i in 0..pages {
            let va = base + i * PAGE_SIZE;
            let mapped = match frames.alloc_frame_zeroed() {
                Ok(pa) => {
                    let result = space.map(frames, va, pa, flags);
                    if result.is_err() {
                        let _ = frames.free_frame(pa);
                    }
                    result
                }
                Err(err) => Err(err),
            };

            if let Err(err) = mapped {
                log_warn!(
                    LOG_ORIGIN,
                    "Allocation of {} pages failed at page {} ({}), unwinding",
                    pages,
                    i,
                    err
                );
                self.unmap_pages(frames, space, base, i, true);
                return Err(err);
            }
        }

        self.commit(
            slot,
            VirtualRegion {
                base,
                start: base,
                size: bytes,
                flags,
                owns_frames: true,
            },
        );
        log_debug!(LOG_ORIGIN, "Allocated {} pages at {:#x}", pages, base);
        Ok(base)
    }

    /// Maps an existing physical range into the window. The frames stay
    /// owned by the caller. Returns the virtual address of `phys`.
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        phys: usize,
        size: usize,
        flags: PageFlags,
    ) -> KernelResult<usize> {
        if size == 0 || phys == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let offset = phys & (PAGE_SIZE - 1);
        let first = phys - offset;
        let bytes = size
            .checked_add(offset + PAGE_SIZE - 1)
            .map(|end| end & !(PAGE_SIZE - 1))
            .ok_or(KernelError::InvalidArgument)?;
        let (slot, base) = self.reserve(bytes)?;

        space.map_range(frames, base, first, bytes, flags)?;

        self.commit(
            slot,
            VirtualRegion {
                base,
                start: base + offset,
                size: bytes,
                flags,
                owns_frames: false,
            },
        );
        Ok(base + offset)
    }

    fn unmap_pages(
        &mut self,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        base: usize,
        pages: usize,
        owns_frames: bool,
    ) {
        for i in 0..pages {
            match space.unmap(frames, base + i * PAGE_SIZE) {
                Ok(pa) if owns_frames => {
                    let _ = frames.free_frame(pa);
                }
                Ok(_) => {}
                Err(err) => log_warn!(
                    LOG_ORIGIN,
                    "Page {:#x} was not mapped during release ({})",
                    base + i * PAGE_SIZE,
                    err
                ),
            }
        }
    }

    /// Releases the region whose `alloc` or `map` returned `ptr`.
    pub fn free(
        &mut self,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        ptr: usize,
    ) -> KernelResult<()> {
        let slot = self
            .regions
            .iter()
            .position(|r| matches!(r, Some(region) if region.start == ptr))
            .ok_or(KernelError::InvalidArgument)?;
        let Some(region) = self.regions[slot].take() else {
            return Err(KernelError::InvalidArgument);
        };

        self.unmap_pages(frames, space, region.base, region.pages(), region.owns_frames);

        self.live -= 1;
        self.mapped_pages -= region.pages();
        self.frees += 1;

        if region.end() == self.cursor {
            self.cursor = self
                .regions
                .iter()
                .flatten()
                .map(VirtualRegion::end)
                .max()
                .unwrap_or(self.base);
        }

        log_debug!(LOG_ORIGIN, "Freed {} pages at {:#x}", region.pages(), region.base);
        Ok(())
    }

    /// The live region containing `addr`, if any.
    pub fn region(&self, addr: usize) -> Option<VirtualRegion> {
        self.regions.iter().flatten().find(|r| r.contains(addr)).copied()
    }

    pub fn stats(&self) -> VmmStats {
        VmmStats {
            window_base: self.base,
            window_size: self.size,
            cursor: self.cursor,
            live_regions: self.live,
            mapped_pages: self.mapped_pages,
            allocations: self.allocations,
            frees: self.frees,
        }
    }
}
