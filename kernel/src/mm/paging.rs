// Page Table Management
//
// Implements x86_64 4-level paging over explicit roots: every operation
// names the root table it works on, so the same code serves the kernel
// template space and every process address space.
//
// Key responsibilities:
// - Map, unmap and query individual 4 KiB pages under a given root
// - Create intermediate tables lazily on first touch of each level
// - Reclaim intermediate tables that become empty after an unmap
// - Release the private half of a root when its address space dies
//
// Address space model:
// - PML4 -> PDPT -> PD -> PT, 512 entries per level, 4 KiB leaves only
// - PML4 slots 256..512 form the kernel half; they point at PDPTs shared by
//   every root, so those PDPTs are never freed here
// - PDs and PTs below a shared PDPT are reclaimed normally: clearing the
//   shared parent entry is visible from every root at once
//
// Correctness and safety notes:
// - `map_page` is all-or-nothing: tables created by a failed call are
//   released before the error is returned
// - The affected TLB entry is invalidated after every change
// - Tables are reached through the physical window (`PhysMemory`) and are
//   always allocated zeroed
//
// Limitations:
// - No huge pages (2 MiB / 1 GiB) and no PCID

use bitflags::bitflags;

use crate::arch;
use crate::config::{is_page_aligned, ENTRIES_PER_TABLE};
use crate::error::KernelError;
use crate::mm::phys::PhysMemory;
use crate::mm::pmm::FrameAllocator;

pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
pub const KERNEL_HALF_FIRST_ENTRY: usize = ENTRIES_PER_TABLE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Unaligned,
    AlreadyMapped,
    NotMapped,
    OutOfMemory,
}

impl From<VmError> for KernelError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfMemory => KernelError::ResourceExhausted,
            VmError::Unaligned | VmError::AlreadyMapped | VmError::NotMapped => {
                KernelError::InvalidArgument
            }
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    pub const fn kernel_rw() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::GLOBAL)
    }

    pub const fn kernel_rw_nx() -> Self {
        Self::kernel_rw().union(Self::NO_EXECUTE)
    }

    pub const fn device() -> Self {
        Self::kernel_rw_nx().union(Self::CACHE_DISABLE)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn addr(&self) -> usize {
        (self.0 & ADDR_MASK) as usize
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    fn set(&mut self, addr: usize, flags: PageFlags) {
        self.0 = (addr as u64 & ADDR_MASK) | flags.bits();
    }

    pub(crate) fn set_table(&mut self, table: usize) {
        self.set(table, PageFlags::PRESENT | PageFlags::WRITABLE);
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

/// PML4, PDPT, PD and PT indices of a virtual address.
pub const fn split_indices(va: usize) -> [usize; 4] {
    [
        (va >> 39) & 0x1FF,
        (va >> 30) & 0x1FF,
        (va >> 21) & 0x1FF,
        (va >> 12) & 0x1FF,
    ]
}

/// # Safety
///
/// `pa` must be the physical address of a live page table reachable through
/// `phys`, and the caller must not create overlapping mutable borrows.
pub(crate) unsafe fn table_mut<'a>(phys: PhysMemory, pa: usize) -> &'a mut PageTable {
    &mut *phys.ptr::<PageTable>(pa)
}

unsafe fn table<'a>(phys: PhysMemory, pa: usize) -> &'a PageTable {
    &*phys.ptr::<PageTable>(pa)
}

/// Walks to the leaf table of `va` without creating anything. Returns the
/// physical addresses of the PDPT, PD and PT on the path.
fn walk(phys: PhysMemory, root: usize, va: usize) -> Option<[usize; 3]> {
    let idx = split_indices(va);
    let mut path = [0usize; 3];
    let mut current = root;

    for level in 0..3 {
        // SAFETY: `current` is the root or was read from a present entry.
        let entry = unsafe { table(phys, current) }.entries[idx[level]];
        if !entry.is_present() {
            return None;
        }
        current = entry.addr();
        path[level] = current;
    }

    Some(path)
}

pub fn map_page(
    frames: &mut FrameAllocator,
    root: usize,
    va: usize,
    pa: usize,
    flags: PageFlags,
) -> Result<(), VmError> {
    if !is_page_aligned(va) || !is_page_aligned(pa) {
        return Err(VmError::Unaligned);
    }

    let phys = frames.phys();
    let idx = split_indices(va);
    let user_access = flags.contains(PageFlags::USER);

    let mut table_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if user_access {
        table_flags |= PageFlags::USER;
    }

    // (parent table, entry index) for every table created by this call.
    let mut created: [(usize, usize); 3] = [(0, 0); 3];
    let mut created_count = 0;
    let mut current = root;

    for level in 0..3 {
        // SAFETY: `current` is the root or a table this walk just validated.
        let parent = unsafe { table_mut(phys, current) };
        let entry = &mut parent.entries[idx[level]];

        if entry.is_present() {
            if user_access && !entry.flags().contains(PageFlags::USER) {
                entry.set(entry.addr(), entry.flags() | PageFlags::USER);
            }
            current = entry.addr();
            continue;
        }

        let Ok(next) = frames.alloc_frame_zeroed() else {
            rollback_created(frames, &created[..created_count]);
            return Err(VmError::OutOfMemory);
        };
        entry.set(next, table_flags);
        created[created_count] = (current, idx[level]);
        created_count += 1;
        current = next;
    }

    // SAFETY: `current` now names the leaf table for `va`.
    let leaf = &mut unsafe { table_mut(phys, current) }.entries[idx[3]];
    if leaf.is_present() {
        return Err(VmError::AlreadyMapped);
    }
    leaf.set(pa, flags | PageFlags::PRESENT);
    arch::flush_page(va);

    Ok(())
}

fn rollback_created(frames: &mut FrameAllocator, created: &[(usize, usize)]) {
    let phys = frames.phys();
    for &(parent, index) in created.iter().rev() {
        // SAFETY: `parent` is a live table whose entry this call just filled.
        let entry = &mut unsafe { table_mut(phys, parent) }.entries[index];
        let pa = entry.addr();
        entry.clear();
        let _ = frames.free_frame(pa);
    }
}

/// Clears the leaf mapping of `va` and returns the frame it pointed at.
/// Intermediate tables left empty are returned to the frame allocator,
/// except the kernel-half PDPTs shared by every root.
pub fn unmap_page(frames: &mut FrameAllocator, root: usize, va: usize) -> Result<usize, VmError> {
    if !is_page_aligned(va) {
        return Err(VmError::Unaligned);
    }

    let phys = frames.phys();
    let idx = split_indices(va);
    let [pdpt, pd, pt] = walk(phys, root, va).ok_or(VmError::NotMapped)?;

    // SAFETY: `pt` comes from a successful walk.
    let leaf = &mut unsafe { table_mut(phys, pt) }.entries[idx[3]];
    if !leaf.is_present() {
        return Err(VmError::NotMapped);
    }
    let old = leaf.addr();
    leaf.clear();
    arch::flush_page(va);

    reclaim_empty_tables(frames, root, [pdpt, pd, pt], idx);

    Ok(old)
}

fn reclaim_empty_tables(
    frames: &mut FrameAllocator,
    root: usize,
    path: [usize; 3],
    idx: [usize; 4],
) {
    let phys = frames.phys();
    let parents = [root, path[0], path[1]];
    let lowest_reclaimable = if idx[0] >= KERNEL_HALF_FIRST_ENTRY { 1 } else { 0 };

    // Bottom-up: PT (level 2), PD (level 1), PDPT (level 0).
    for level in (lowest_reclaimable..3).rev() {
        // SAFETY: every address on the path was validated by `walk`.
        if !unsafe { table(phys, path[level]) }.is_empty() {
            return;
        }
        unsafe { table_mut(phys, parents[level]) }.entries[idx[level]].clear();
        let _ = frames.free_frame(path[level]);
    }
}

pub fn query(phys: PhysMemory, root: usize, va: usize) -> Result<(usize, PageFlags), VmError> {
    let [_, _, pt] = walk(phys, root, va).ok_or(VmError::NotMapped)?;
    // SAFETY: `pt` comes from a successful walk.
    let leaf = unsafe { table(phys, pt) }.entries[split_indices(va)[3]];
    if !leaf.is_present() {
        return Err(VmError::NotMapped);
    }
    Ok((leaf.addr(), leaf.flags()))
}

/// Physical address backing `va`, page offset included.
pub fn translate(phys: PhysMemory, root: usize, va: usize) -> Option<usize> {
    query(phys, root, va & !0xFFF)
        .ok()
        .map(|(pa, _)| pa | (va & 0xFFF))
}

/// Like `translate`, with 0 standing for "not mapped".
pub fn get_physical_address(phys: PhysMemory, root: usize, va: usize) -> usize {
    translate(phys, root, va).unwrap_or(0)
}

/// Frees every intermediate table of the lower (private) half of `root`
/// and clears the corresponding root entries. Leaf frames are not touched;
/// they belong to whoever mapped them.
pub fn release_lower_half(frames: &mut FrameAllocator, root: usize) {
    let phys = frames.phys();

    for i in 0..KERNEL_HALF_FIRST_ENTRY {
        // SAFETY: `root` is a live root table.
        let pml4e = unsafe { table(phys, root) }.entries[i];
        if !pml4e.is_present() {
            continue;
        }
        let pdpt = pml4e.addr();

        for j in 0..ENTRIES_PER_TABLE {
            let pdpte = unsafe { table(phys, pdpt) }.entries[j];
            if !pdpte.is_present() {
                continue;
            }
            let pd = pdpte.addr();

            for k in 0..ENTRIES_PER_TABLE {
                let pde = unsafe { table(phys, pd) }.entries[k];
                if pde.is_present() {
                    let _ = frames.free_frame(pde.addr());
                }
            }
            let _ = frames.free_frame(pd);
        }
        let _ = frames.free_frame(pdpt);
        unsafe { table_mut(phys, root) }.entries[i].clear();
    }
}
