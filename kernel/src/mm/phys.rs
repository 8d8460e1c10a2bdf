// Physical Memory Window
//
// The kernel reaches physical frames through a linear window: physical
// address `pa` is visible at virtual address `offset + pa`. The boot stub
// establishes this window and reports its offset; every subsystem that
// needs to touch a frame's contents (page tables, zeroing, the PMM bitmap)
// goes through `PhysMemory` instead of computing addresses by hand.
//
// Correctness notes:
// - `PhysMemory` is a plain copyable handle; it carries no ownership
// - Physical address 0 is never a valid frame and is used as "absent"

use core::ptr;

use crate::config::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMemory {
    offset: usize,
}

impl PhysMemory {
    /// # Safety
    ///
    /// Every physical frame the allocators hand out must be mapped,
    /// readable and writable at `offset + pa` for the lifetime of the
    /// returned handle.
    pub const unsafe fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn ptr<T>(&self, pa: usize) -> *mut T {
        self.offset.wrapping_add(pa) as *mut T
    }

    pub fn zero_frame(&self, pa: usize) {
        // SAFETY: `new` guarantees every frame is mapped at offset + pa.
        unsafe { ptr::write_bytes(self.ptr::<u8>(pa), 0, PAGE_SIZE) };
    }

    pub fn zero_frames(&self, pa: usize, count: usize) {
        // SAFETY: as in `zero_frame`; the range is contiguous physically and
        // therefore contiguous in the window.
        unsafe { ptr::write_bytes(self.ptr::<u8>(pa), 0, count * PAGE_SIZE) };
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::boot::{MemoryKind, MemoryRegion};
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// Host-side stand-in for physical RAM: a zeroed, page-aligned buffer
    /// whose address doubles as the window offset.
    pub struct SimulatedRam {
        base: *mut u8,
        layout: Layout,
    }

    impl SimulatedRam {
        pub fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
            let base = unsafe { alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self { base, layout }
        }

        pub fn with_frames(frames: usize) -> Self {
            Self::new(frames * PAGE_SIZE)
        }

        pub fn phys(&self) -> PhysMemory {
            unsafe { PhysMemory::new(self.base as usize) }
        }

        pub fn size(&self) -> usize {
            self.layout.size()
        }

        /// Frame 0 reserved, everything else usable.
        pub fn regions(&self) -> [MemoryRegion; 2] {
            [
                MemoryRegion::new(0, PAGE_SIZE, MemoryKind::Reserved),
                MemoryRegion::usable(PAGE_SIZE, self.size() - PAGE_SIZE),
            ]
        }
    }

    impl Drop for SimulatedRam {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, self.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SimulatedRam;
    use super::*;

    #[test]
    fn window_translates_by_offset() {
        let ram = SimulatedRam::with_frames(4);
        let phys = ram.phys();
        let p = phys.ptr::<u64>(2 * PAGE_SIZE);
        assert_eq!(p as usize, phys.offset() + 2 * PAGE_SIZE);
    }

    #[test]
    fn zero_frame_clears_contents() {
        let ram = SimulatedRam::with_frames(4);
        let phys = ram.phys();
        let p = phys.ptr::<u8>(PAGE_SIZE);
        unsafe {
            ptr::write_bytes(p, 0xAB, PAGE_SIZE);
        }
        phys.zero_frame(PAGE_SIZE);
        let bytes = unsafe { core::slice::from_raw_parts(p, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
