// Physical Memory Manager (PMM)
//
// Implements the physical frame allocator on top of a bitmap, one bit per
// 4 KiB frame. The allocator is built once from the boot memory map and is
// owned by the `MemoryManager`; callers serialize access through its lock.
//
// Key responsibilities:
// - Discover usable physical memory from the boot region list
// - Allocate and free single frames in O(1) amortized time
// - Allocate and free contiguous frame runs for multi-page buffers
// - Detect double frees and refuse them without touching the bitmap
// - Expose counters for diagnostics and leak checks
//
// Implementation details:
// - Bit value 1 = allocated/unavailable, 0 = free
// - The bitmap starts as "all allocated"; only `Usable` regions are cleared
// - The bitmap itself lives in the first usable region large enough to hold
//   it, reached through the physical window; its frames stay allocated
// - Frame 0 is never handed out so that address 0 can mean "absent"
// - A next-fit word hint skips fully allocated 64-bit words quickly
//
// Correctness and safety notes:
// - Every frame is owned by exactly one party: the pool or its allocator's
//   caller; `free_frame` of a frame already in the pool is `DoubleFree`
// - Addresses outside the tracked range or not page aligned are rejected
//   with `InvalidArgument`

use core::slice;

use crate::boot::MemoryRegion;
use crate::config::{is_page_aligned, page_align_up, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::phys::PhysMemory;
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "pmm";
const BITS_PER_WORD: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub used_frames: usize,
    pub allocations: u64,
    pub frees: u64,
    pub double_frees: u64,
}

pub struct FrameAllocator {
    phys: PhysMemory,
    bitmap: &'static mut [u64],
    total_frames: usize,
    free_frames: usize,
    next_hint: usize,
    allocations: u64,
    frees: u64,
    double_frees: u64,
}

impl FrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// # Safety
    ///
    /// `phys` must map every frame described by `regions`, and no usable
    /// frame may be in use by anyone else.
    pub unsafe fn new(phys: PhysMemory, regions: &[MemoryRegion]) -> KernelResult<Self> {
        let tracked_end = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.end() & !(PAGE_SIZE - 1))
            .max()
            .unwrap_or(0);

        let total_frames = tracked_end / PAGE_SIZE;
        if total_frames < 2 {
            return Err(KernelError::ResourceExhausted);
        }

        let words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_frames = page_align_up(words * 8) / PAGE_SIZE;

        let bitmap_base = regions
            .iter()
            .filter(|r| r.is_usable())
            .find_map(|r| {
                let start = page_align_up(r.base).max(PAGE_SIZE);
                let end = r.end() & !(PAGE_SIZE - 1);
                (end > start && (end - start) / PAGE_SIZE >= bitmap_frames).then_some(start)
            })
            .ok_or(KernelError::ResourceExhausted)?;

        let bitmap = slice::from_raw_parts_mut(phys.ptr::<u64>(bitmap_base), words);
        bitmap.fill(u64::MAX);

        let mut allocator = Self {
            phys,
            bitmap,
            total_frames,
            free_frames: 0,
            next_hint: 0,
            allocations: 0,
            frees: 0,
            double_frees: 0,
        };

        for region in regions.iter().filter(|r| r.is_usable()) {
            let first = page_align_up(region.base) / PAGE_SIZE;
            let last = (region.end() / PAGE_SIZE).min(total_frames);
            for frame in first..last {
                allocator.mark_free(frame);
            }
        }

        allocator.mark_used(0);
        let bitmap_first = bitmap_base / PAGE_SIZE;
        for frame in bitmap_first..bitmap_first + bitmap_frames {
            allocator.mark_used(frame);
        }

        log_info!(
            LOG_ORIGIN,
            "PMM initialized: tracked_frames={}, free_frames={}, bitmap at {:#x} ({} frames)",
            total_frames,
            allocator.free_frames,
            bitmap_base,
            bitmap_frames
        );

        Ok(allocator)
    }

    pub fn phys(&self) -> PhysMemory {
        self.phys
    }

    #[inline]
    fn is_free(&self, frame: usize) -> bool {
        self.bitmap[frame / BITS_PER_WORD] & (1 << (frame % BITS_PER_WORD)) == 0
    }

    fn mark_free(&mut self, frame: usize) {
        if frame < self.total_frames && !self.is_free(frame) {
            self.bitmap[frame / BITS_PER_WORD] &= !(1 << (frame % BITS_PER_WORD));
            self.free_frames += 1;
        }
    }

    fn mark_used(&mut self, frame: usize) {
        if frame < self.total_frames && self.is_free(frame) {
            self.bitmap[frame / BITS_PER_WORD] |= 1 << (frame % BITS_PER_WORD);
            self.free_frames -= 1;
        }
    }

    pub fn alloc_frame(&mut self) -> KernelResult<usize> {
        if self.free_frames == 0 {
            return Err(KernelError::ResourceExhausted);
        }

        let words = self.bitmap.len();
        for step in 0..words {
            let index = (self.next_hint + step) % words;
            let word = self.bitmap[index];
            if word == u64::MAX {
                continue;
            }

            let frame = index * BITS_PER_WORD + (!word).trailing_zeros() as usize;
            if frame >= self.total_frames {
                continue;
            }

            self.mark_used(frame);
            self.next_hint = index;
            self.allocations += 1;
            return Ok(frame * PAGE_SIZE);
        }

        Err(KernelError::ResourceExhausted)
    }

    pub fn alloc_frame_zeroed(&mut self) -> KernelResult<usize> {
        let pa = self.alloc_frame()?;
        self.phys.zero_frame(pa);
        Ok(pa)
    }

    fn check_frame(&self, pa: usize) -> KernelResult<usize> {
        if pa == 0 || !is_page_aligned(pa) || pa / PAGE_SIZE >= self.total_frames {
            return Err(KernelError::InvalidArgument);
        }
        Ok(pa / PAGE_SIZE)
    }

    pub fn free_frame(&mut self, pa: usize) -> KernelResult<()> {
        let frame = self.check_frame(pa)?;

        if self.is_free(frame) {
            self.double_frees += 1;
            log_warn!(LOG_ORIGIN, "Double free of frame {:#x} ignored", pa);
            return Err(KernelError::DoubleFree);
        }

        self.mark_free(frame);
        self.frees += 1;
        let word = frame / BITS_PER_WORD;
        if word < self.next_hint {
            self.next_hint = word;
        }
        Ok(())
    }

    /// Allocates `count` physically contiguous frames.
    pub fn alloc_frames(&mut self, count: usize) -> KernelResult<usize> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if count == 1 {
            return self.alloc_frame();
        }
        if self.free_frames < count {
            return Err(KernelError::ResourceExhausted);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 1..self.total_frames {
            if !self.is_free(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;

            if run_len == count {
                for f in run_start..run_start + count {
                    self.mark_used(f);
                }
                self.allocations += count as u64;
                return Ok(run_start * PAGE_SIZE);
            }
        }

        Err(KernelError::ResourceExhausted)
    }

    /// Returns a run from `alloc_frames`. The whole run is validated before
    /// any frame is released.
    pub fn free_frames(&mut self, pa: usize, count: usize) -> KernelResult<()> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let first = self.check_frame(pa)?;
        if first + count > self.total_frames {
            return Err(KernelError::InvalidArgument);
        }
        if (first..first + count).any(|f| self.is_free(f)) {
            self.double_frees += 1;
            log_warn!(LOG_ORIGIN, "Double free inside run {:#x} (+{}) ignored", pa, count);
            return Err(KernelError::DoubleFree);
        }

        for frame in first..first + count {
            self.mark_free(frame);
        }
        self.frees += count as u64;
        self.next_hint = self.next_hint.min(first / BITS_PER_WORD);
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free_frames
    }

    pub fn total_count(&self) -> usize {
        self.total_frames
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            used_frames: self.total_frames - self.free_frames,
            allocations: self.allocations,
            frees: self.frees,
            double_frees: self.double_frees,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::MemoryKind;
    use crate::mm::phys::testing::SimulatedRam;
    use std::vec::Vec;

    fn allocator(ram: &SimulatedRam) -> FrameAllocator {
        unsafe { FrameAllocator::new(ram.phys(), &ram.regions()).unwrap() }
    }

    #[test]
    fn frame_zero_and_bitmap_are_reserved() {
        let ram = SimulatedRam::with_frames(64);
        let pmm = allocator(&ram);
        // 64 frames, minus frame 0, minus one bitmap frame.
        assert_eq!(pmm.total_count(), 64);
        assert_eq!(pmm.free_count(), 62);
    }

    #[test]
    fn balanced_alloc_free_preserves_free_count() {
        let ram = SimulatedRam::with_frames(128);
        let mut pmm = allocator(&ram);
        let before = pmm.free_count();

        let frames: Vec<usize> = (0..40).map(|_| pmm.alloc_frame().unwrap()).collect();
        assert_eq!(pmm.free_count(), before - 40);
        assert!(frames.iter().all(|&f| f != 0 && f % PAGE_SIZE == 0));

        for &f in frames.iter().rev() {
            pmm.free_frame(f).unwrap();
        }
        assert_eq!(pmm.free_count(), before);
    }

    #[test]
    fn allocations_are_distinct() {
        let ram = SimulatedRam::with_frames(32);
        let mut pmm = allocator(&ram);
        let mut frames = Vec::new();
        while let Ok(f) = pmm.alloc_frame() {
            frames.push(f);
        }
        let mut sorted = frames.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), frames.len());
        assert_eq!(pmm.alloc_frame(), Err(KernelError::ResourceExhausted));
    }

    #[test]
    fn double_free_is_rejected_without_state_change() {
        let ram = SimulatedRam::with_frames(16);
        let mut pmm = allocator(&ram);
        let f = pmm.alloc_frame().unwrap();
        pmm.free_frame(f).unwrap();
        let free = pmm.free_count();

        assert_eq!(pmm.free_frame(f), Err(KernelError::DoubleFree));
        assert_eq!(pmm.free_count(), free);
        assert_eq!(pmm.stats().double_frees, 1);
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let ram = SimulatedRam::with_frames(16);
        let mut pmm = allocator(&ram);
        assert_eq!(pmm.free_frame(0), Err(KernelError::InvalidArgument));
        assert_eq!(pmm.free_frame(PAGE_SIZE + 1), Err(KernelError::InvalidArgument));
        assert_eq!(pmm.free_frame(1 << 40), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn reserved_regions_are_never_handed_out() {
        let ram = SimulatedRam::with_frames(32);
        let regions = [
            MemoryRegion::new(0, 8 * PAGE_SIZE, MemoryKind::Reserved),
            MemoryRegion::usable(8 * PAGE_SIZE, 8 * PAGE_SIZE),
            MemoryRegion::new(16 * PAGE_SIZE, 16 * PAGE_SIZE, MemoryKind::KernelImage),
        ];
        let mut pmm = unsafe { FrameAllocator::new(ram.phys(), &regions).unwrap() };
        while let Ok(f) = pmm.alloc_frame() {
            assert!((8 * PAGE_SIZE..16 * PAGE_SIZE).contains(&f));
        }
    }

    #[test]
    fn contiguous_runs_round_trip() {
        let ram = SimulatedRam::with_frames(64);
        let mut pmm = allocator(&ram);
        let before = pmm.free_count();

        let run = pmm.alloc_frames(8).unwrap();
        for i in 0..8 {
            assert!(!pmm.is_free(run / PAGE_SIZE + i));
        }
        assert_eq!(pmm.free_count(), before - 8);

        pmm.free_frames(run, 8).unwrap();
        assert_eq!(pmm.free_count(), before);
        assert_eq!(pmm.free_frames(run, 8), Err(KernelError::DoubleFree));
    }

    #[test]
    fn zeroed_allocation_clears_previous_contents() {
        let ram = SimulatedRam::with_frames(16);
        let mut pmm = allocator(&ram);
        let f = pmm.alloc_frame().unwrap();
        unsafe { core::ptr::write_bytes(ram.phys().ptr::<u8>(f), 0x5A, PAGE_SIZE) };
        pmm.free_frame(f).unwrap();

        let g = pmm.alloc_frame_zeroed().unwrap();
        assert_eq!(g, f);
        let bytes = unsafe { core::slice::from_raw_parts(ram.phys().ptr::<u8>(g), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
