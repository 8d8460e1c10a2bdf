// Address Space Management
//
// Implements creation, isolation, and teardown of virtual address spaces.
// Each address space is one independent PML4 whose kernel half is shared
// with the kernel template space and whose lower half is private.
//
// Key responsibilities:
// - Create process address spaces that mirror the template's kernel half
// - Map, unmap and translate pages within one space
// - Reject private mappings that would land in the shared kernel half
// - Switch the CPU to a space and release a space's private tables
//
// Design principles:
// - Kernel half entries are copied by reference: the PML4 slots point at
//   the same PDPTs, so later kernel mappings appear in every space
// - The template pre-creates the PDPTs covering the kernel VMM window;
//   without that a new top-level table would be invisible to older spaces
// - Teardown is explicit (`destroy`) so frames always go back to the
//   allocator that produced them
//
// Correctness and safety notes:
// - A space's lower half starts empty
// - `map_range` rolls back every page it mapped when one page fails
// - `destroy` never touches the shared kernel half

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::config::{is_page_aligned, ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::paging::{self, PageFlags, PageTableEntry, KERNEL_HALF_FIRST_ENTRY};
use crate::mm::phys::PhysMemory;
use crate::mm::pmm::FrameAllocator;
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "addrspace";
const KERNEL_BASE: usize = 0xFFFF_8000_0000_0000;
pub const USER_CANONICAL_MAX: usize = 0x0000_7FFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        AddressSpaceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS:{}", self.0)
    }
}

#[derive(Debug)]
pub struct AddressSpace {
    id: AddressSpaceId,
    root: usize,
    kernel: bool,
    mapping_count: usize,
}

impl AddressSpace {
    /// Builds an empty kernel template space with a fresh root.
    pub fn new_template(frames: &mut FrameAllocator) -> KernelResult<Self> {
        let root = frames.alloc_frame_zeroed()?;
        Ok(Self {
            id: AddressSpaceId::new(),
            root,
            kernel: true,
            mapping_count: 0,
        })
    }

    /// Wraps the root table the boot stub left active as the kernel template.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 reachable through the physical window and
    /// must not be owned by anything else.
    pub unsafe fn adopt(root: usize) -> Self {
        Self {
            id: AddressSpaceId::new(),
            root,
            kernel: true,
            mapping_count: 0,
        }
    }

    /// Creates a process space: fresh root, lower half empty, kernel half
    /// copied entry by entry from `template`.
    pub fn create(frames: &mut FrameAllocator, template: &AddressSpace) -> KernelResult<Self> {
        let root = frames.alloc_frame_zeroed()?;
        let phys = frames.phys();

        // SAFETY: both roots are live tables; `root` was just allocated and
        // is distinct from the template root.
        let (src, dst) = unsafe {
            (
                paging::table_mut(phys, template.root),
                paging::table_mut(phys, root),
            )
        };
        dst.entries[KERNEL_HALF_FIRST_ENTRY..]
            .copy_from_slice(&src.entries[KERNEL_HALF_FIRST_ENTRY..]);

        let space = Self {
            id: AddressSpaceId::new(),
            root,
            kernel: false,
            mapping_count: 0,
        };
        log_debug!(LOG_ORIGIN, "Created address space {} (root={:#x})", space.id, root);
        Ok(space)
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn mapping_count(&self) -> usize {
        self.mapping_count
    }

    /// Makes sure the kernel-half PDPTs covering `[base, base + size)` exist,
    /// so that later mappings there are shared with every space created
    /// from this template.
    pub fn ensure_kernel_tables(
        &mut self,
        frames: &mut FrameAllocator,
        base: usize,
        size: usize,
    ) -> KernelResult<()> {
        if !self.kernel || base < KERNEL_BASE || size == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let first = paging::split_indices(base)[0];
        let last = paging::split_indices(base + (size - 1))[0];
        let phys = frames.phys();

        for index in first..=last {
            // SAFETY: `self.root` is a live root table.
            let present = unsafe { paging::table_mut(phys, self.root) }.entries[index].is_present();
            if present {
                continue;
            }
            let pdpt = frames.alloc_frame_zeroed()?;
            let entry = &mut unsafe { paging::table_mut(phys, self.root) }.entries[index];
            *entry = kernel_table_entry(pdpt);
        }
        Ok(())
    }

    fn check_range(&self, va: usize) -> KernelResult<()> {
        if !self.kernel && va > USER_CANONICAL_MAX {
            log_warn!(LOG_ORIGIN, "{} rejected kernel-half mapping at {:#x}", self.id, va);
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        va: usize,
        pa: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        self.check_range(va)?;
        paging::map_page(frames, self.root, va, pa, flags)?;
        self.mapping_count += 1;
        Ok(())
    }

    /// Maps `size` bytes of contiguous physical memory starting at `pa`.
    pub fn map_range(
        &mut self,
        frames: &mut FrameAllocator,
        va: usize,
        pa: usize,
        size: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if size == 0 || !is_page_aligned(size) {
            return Err(KernelError::InvalidArgument);
        }
        self.check_range(va)?;
        self.check_range(va + (size - 1))?;

        let pages = size / PAGE_SIZE;
        for i in 0..pages {
            let offset = i * PAGE_SIZE;
            if let Err(err) = paging::map_page(frames, self.root, va + offset, pa + offset, flags) {
                for j in 0..i {
                    let _ = paging::unmap_page(frames, self.root, va + j * PAGE_SIZE);
                }
                self.mapping_count -= i;
                return Err(err.into());
            }
            self.mapping_count += 1;
        }
        Ok(())
    }

    pub fn unmap(&mut self, frames: &mut FrameAllocator, va: usize) -> KernelResult<usize> {
        self.check_range(va)?;
        let pa = paging::unmap_page(frames, self.root, va)?;
        self.mapping_count = self.mapping_count.saturating_sub(1);
        Ok(pa)
    }

    pub fn translate(&self, phys: PhysMemory, va: usize) -> Option<usize> {
        paging::translate(phys, self.root, va)
    }

    pub fn get_physical_address(&self, phys: PhysMemory, va: usize) -> usize {
        paging::get_physical_address(phys, self.root, va)
    }

    pub fn query(&self, phys: PhysMemory, va: usize) -> KernelResult<(usize, PageFlags)> {
        Ok(paging::query(phys, self.root, va)?)
    }

    /// Loads this space's root into the CPU.
    pub fn activate(&self) {
        arch::load_root(self.root);
    }

    pub fn is_active(&self) -> bool {
        arch::active_root() == self.root
    }

    pub fn kernel_half(&self, phys: PhysMemory) -> [PageTableEntry; ENTRIES_PER_TABLE / 2] {
        let mut entries = [PageTableEntry::empty(); ENTRIES_PER_TABLE / 2];
        // SAFETY: `self.root` is a live root table.
        let table = unsafe { paging::table_mut(phys, self.root) };
        entries.copy_from_slice(&table.entries[KERNEL_HALF_FIRST_ENTRY..]);
        entries
    }

    /// Releases the private half and the root. The kernel half is shared
    /// and stays untouched.
    pub fn destroy(self, frames: &mut FrameAllocator) -> KernelResult<()> {
        if self.kernel {
            return Err(KernelError::InvalidArgument);
        }
        if self.mapping_count != 0 {
            log_warn!(
                LOG_ORIGIN,
                "Destroying {} with {} live mappings",
                self.id,
                self.mapping_count
            );
        }
        paging::release_lower_half(frames, self.root);
        frames.free_frame(self.root)?;
        log_debug!(LOG_ORIGIN, "Destroyed address space {}", self.id);
        Ok(())
    }
}

fn kernel_table_entry(pdpt: usize) -> PageTableEntry {
    let mut entry = PageTableEntry::empty();
    entry.set_table(pdpt);
    entry
}
