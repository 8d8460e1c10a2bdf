// Kernel Heap Allocator
//
// General-purpose allocator for kernel data structures, carved out of one
// contiguous arena that the VMM provides at boot. Exposes the classic
// kmalloc/kfree/krealloc/kcalloc quartet and a `GlobalAlloc` adapter so the
// `alloc` collections draw from the same arena on bare metal.
//
// Key responsibilities:
// - First-fit allocation over an address-ordered block list
// - Splitting oversized blocks and eagerly merging free neighbours
// - Detecting repeated or foreign frees without corrupting the list
// - Usage statistics for diagnostics and leak checks
//
// Implementation details:
// - Every block starts with an in-band `BlockHeader` (32 bytes): payload
//   size, magic, free flag and the offsets of its neighbours
// - Links are arena offsets rather than pointers; `NONE` ends the list
// - Payloads are 8-byte aligned; a block is split only when the remainder
//   can hold a header plus `MIN_BLOCK_SIZE` bytes
// - Absorbed headers have their magic cleared so stale pointers never
//   validate again
//
// Correctness and safety notes:
// - `kfree` validates its argument against the live block list before
//   touching anything; a pointer to a free block (or into the span of a
//   merged one) is `DoubleFree`, anything else unknown is `InvalidArgument`
// - A failed `krealloc` leaves the original block untouched
// - The global instance is a `spin::Mutex` taken with interrupts disabled

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::arch::without_interrupts;
use crate::error::{KernelError, KernelResult};
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "heap";

pub const ALIGN: usize = 8;
pub const MIN_BLOCK_SIZE: usize = 32;
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const BLOCK_MAGIC: u32 = 0x4B48_4550;
const NONE: usize = usize::MAX;

#[repr(C)]
struct BlockHeader {
    size: usize,
    magic: u32,
    free: u32,
    prev: usize,
    next: usize,
}

impl BlockHeader {
    fn is_free(&self) -> bool {
        self.free != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: usize,
    pub size: usize,
    pub free: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub arena_size: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
    pub allocations: u64,
    pub frees: u64,
    pub double_frees: u64,
}

#[inline]
const fn align_up(value: usize) -> usize {
    (value + ALIGN - 1) & !(ALIGN - 1)
}

pub struct Heap {
    base: usize,
    size: usize,
    allocations: u64,
    frees: u64,
    double_frees: u64,
}

impl Heap {
    /// Builds a heap over `[base, base + size)` as a single free block.
    ///
    /// # Safety
    ///
    /// The arena must be writable, exclusively owned by the heap, and live
    /// for as long as the heap and every pointer it hands out.
    pub unsafe fn new(base: usize, size: usize) -> KernelResult<Self> {
        if base == 0 || base % ALIGN != 0 || size < HEADER_SIZE + MIN_BLOCK_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let size = size & !(ALIGN - 1);

        let heap = Self {
            base,
            size,
            allocations: 0,
            frees: 0,
            double_frees: 0,
        };
        ptr::write(
            heap.header(0),
            BlockHeader {
                size: size - HEADER_SIZE,
                magic: BLOCK_MAGIC,
                free: 1,
                prev: NONE,
                next: NONE,
            },
        );
        Ok(heap)
    }

    #[inline]
    fn header(&self, offset: usize) -> *mut BlockHeader {
        (self.base + offset) as *mut BlockHeader
    }

    #[inline]
    fn block(&self, offset: usize) -> &mut BlockHeader {
        // SAFETY: offsets only come from the block list, which always
        // points at initialized headers inside the arena.
        unsafe { &mut *self.header(offset) }
    }

    #[inline]
    fn payload(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: the arena base is non-zero, so base + offset + header is too.
        unsafe { NonNull::new_unchecked((self.base + offset + HEADER_SIZE) as *mut u8) }
    }

    fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            heap: self,
            offset: 0,
        }
    }

    pub fn kmalloc(&mut self, size: usize) -> KernelResult<NonNull<u8>> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if size > self.size {
            return Err(KernelError::ResourceExhausted);
        }
        let size = align_up(size);

        let offset = self
            .blocks()
            .find(|b| b.free && b.size >= size)
            .map(|b| b.offset)
            .ok_or(KernelError::ResourceExhausted)?;

        self.split(offset, size);
        self.block(offset).free = 0;
        self.allocations += 1;
        Ok(self.payload(offset))
    }

    fn split(&mut self, offset: usize, size: usize) {
        let (block_size, next) = {
            let block = self.block(offset);
            (block.size, block.next)
        };
        if block_size <= size + HEADER_SIZE + MIN_BLOCK_SIZE {
            return;
        }

        let rest = offset + HEADER_SIZE + size;
        // SAFETY: `rest` lies inside the block being split.
        unsafe {
            ptr::write(
                self.header(rest),
                BlockHeader {
                    size: block_size - size - HEADER_SIZE,
                    magic: BLOCK_MAGIC,
                    free: 1,
                    prev: offset,
                    next,
                },
            );
        }
        if next != NONE {
            self.block(next).prev = rest;
        }
        let block = self.block(offset);
        block.size = size;
        block.next = rest;
    }

    /// Locates the block whose payload starts at `ptr`.
    fn find(&self, ptr: *mut u8) -> Option<BlockInfo> {
        self.blocks()
            .find(|b| self.payload(b.offset).as_ptr() == ptr)
    }

    fn inside_free_span(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        self.blocks().any(|b| {
            let start = self.base + b.offset + HEADER_SIZE;
            b.free && addr >= start && addr < start + b.size
        })
    }

    pub fn kfree(&mut self, ptr: *mut u8) -> KernelResult<()> {
        if ptr.is_null() {
            return Err(KernelError::InvalidArgument);
        }

        let Some(info) = self.find(ptr) else {
            if self.inside_free_span(ptr) {
                self.double_frees += 1;
                log_warn!(LOG_ORIGIN, "Double free of {:p} (block already merged)", ptr);
                return Err(KernelError::DoubleFree);
            }
            log_warn!(LOG_ORIGIN, "Rejected free of unknown pointer {:p}", ptr);
            return Err(KernelError::InvalidArgument);
        };

        if info.free {
            self.double_frees += 1;
            log_warn!(LOG_ORIGIN, "Double free of {:p} ignored", ptr);
            return Err(KernelError::DoubleFree);
        }

        self.block(info.offset).free = 1;
        self.frees += 1;

        let next = self.block(info.offset).next;
        if next != NONE && self.block(next).is_free() {
            self.absorb_next(info.offset);
        }
        let prev = self.block(info.offset).prev;
        if prev != NONE && self.block(prev).is_free() {
            self.absorb_next(prev);
        }
        Ok(())
    }

    /// Merges the block following `offset` into it.
    fn absorb_next(&mut self, offset: usize) {
        let next = self.block(offset).next;
        let (next_size, after) = {
            let victim = self.block(next);
            victim.magic = 0;
            (victim.size, victim.next)
        };

        let block = self.block(offset);
        block.size += HEADER_SIZE + next_size;
        block.next = after;
        if after != NONE {
            self.block(after).prev = offset;
        }
    }

    pub fn krealloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> KernelResult<Option<NonNull<u8>>> {
        let Some(old) = ptr else {
            return self.kmalloc(size).map(Some);
        };
        if size == 0 {
            self.kfree(old.as_ptr())?;
            return Ok(None);
        }

        let info = self.find(old.as_ptr()).ok_or(KernelError::InvalidArgument)?;
        if info.free {
            return Err(KernelError::DoubleFree);
        }
        if size > self.size {
            return Err(KernelError::ResourceExhausted);
        }
        if info.size >= align_up(size) {
            return Ok(Some(old));
        }

        let new = self.kmalloc(size)?;
        // SAFETY: both blocks are live and distinct; the copy stays within
        // the smaller of the two payloads.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), info.size.min(size));
        }
        self.kfree(old.as_ptr())?;
        Ok(Some(new))
    }

    pub fn kcalloc(&mut self, count: usize, size: usize) -> KernelResult<NonNull<u8>> {
        let total = count.checked_mul(size).ok_or(KernelError::InvalidArgument)?;
        let ptr = self.kmalloc(total)?;
        // SAFETY: `kmalloc` returned at least `total` writable bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Payload capacity of the live block at `ptr`.
    pub fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        self.find(ptr).filter(|b| !b.free).map(|b| b.size)
    }

    pub fn for_each_block(&self, mut f: impl FnMut(BlockInfo)) {
        self.blocks().for_each(|b| f(b));
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.size,
            allocations: self.allocations,
            frees: self.frees,
            double_frees: self.double_frees,
            ..HeapStats::default()
        };
        for b in self.blocks() {
            if b.free {
                stats.free_bytes += b.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(b.size);
            } else {
                stats.used_bytes += b.size;
                stats.used_blocks += 1;
            }
        }
        stats
    }
}

struct BlockIter<'a> {
    heap: &'a Heap,
    offset: usize,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.offset == NONE {
            return None;
        }
        let block = self.heap.block(self.offset);
        if block.magic != BLOCK_MAGIC {
            log_warn!(LOG_ORIGIN, "Corrupted block header at offset {:#x}", self.offset);
            self.offset = NONE;
            return None;
        }
        let info = BlockInfo {
            offset: self.offset,
            size: block.size,
            free: block.is_free(),
        };
        self.offset = block.next;
        Some(info)
    }
}

/// Heap shared by the whole kernel, usable as the `#[global_allocator]`.
pub struct LockedHeap(Mutex<Option<Heap>>);

impl LockedHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(None))
    }

    /// # Safety
    ///
    /// Same contract as [`Heap::new`].
    pub unsafe fn init(&self, base: usize, size: usize) -> KernelResult<()> {
        let heap = Heap::new(base, size)?;
        without_interrupts(|| *self.0.lock() = Some(heap));
        log_info!(LOG_ORIGIN, "Initialized with {} bytes at {:#x}", size, base);
        Ok(())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> KernelResult<R>) -> KernelResult<R> {
        without_interrupts(|| match self.0.lock().as_mut() {
            Some(heap) => f(heap),
            None => Err(KernelError::ResourceExhausted),
        })
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        if layout.align() <= ALIGN {
            return self
                .with(|heap| heap.kmalloc(size))
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-allocate and keep the real block address just below the
        // aligned pointer.
        let Some(padded) = size.checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Ok(raw) = self.with(|heap| heap.kmalloc(padded)) else {
            return ptr::null_mut();
        };
        let raw = raw.as_ptr() as usize;
        let aligned = (raw + size_of::<usize>() + layout.align() - 1) & !(layout.align() - 1);
        ((aligned - size_of::<usize>()) as *mut usize).write(raw);
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let block = if layout.align() <= ALIGN {
            ptr
        } else {
            (ptr as *mut usize).sub(1).read() as *mut u8
        };
        let _ = self.with(|heap| heap.kfree(block));
    }
}

#[cfg_attr(target_os = "none", global_allocator)]
pub static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

pub fn kmalloc(size: usize) -> KernelResult<NonNull<u8>> {
    KERNEL_HEAP.with(|heap| heap.kmalloc(size))
}

pub fn kfree(ptr: *mut u8) -> KernelResult<()> {
    KERNEL_HEAP.with(|heap| heap.kfree(ptr))
}

pub fn krealloc(ptr: Option<NonNull<u8>>, size: usize) -> KernelResult<Option<NonNull<u8>>> {
    KERNEL_HEAP.with(|heap| heap.krealloc(ptr, size))
}

pub fn kcalloc(count: usize, size: usize) -> KernelResult<NonNull<u8>> {
    KERNEL_HEAP.with(|heap| heap.kcalloc(count, size))
}

pub fn stats() -> Option<HeapStats> {
    KERNEL_HEAP.with(|heap| Ok(heap.stats())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    struct Arena {
        _buf: Vec<u64>,
        heap: Heap,
    }

    fn arena(bytes: usize) -> Arena {
        let mut buf = vec![0u64; bytes / 8];
        let heap = unsafe { Heap::new(buf.as_mut_ptr() as usize, bytes).unwrap() };
        Arena { _buf: buf, heap }
    }

    fn topology(heap: &Heap) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        heap.for_each_block(|b| out.push(b));
        out
    }

    #[test]
    fn header_is_32_bytes() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn zero_size_is_invalid_and_huge_is_exhausted() {
        let mut a = arena(4096);
        assert_eq!(a.heap.kmalloc(0), Err(KernelError::InvalidArgument));
        assert_eq!(a.heap.kmalloc(1 << 20), Err(KernelError::ResourceExhausted));
    }

    #[test]
    fn allocations_are_aligned_and_split() {
        let mut a = arena(4096);
        let p = a.heap.kmalloc(13).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        assert_eq!(a.heap.usable_size(p.as_ptr()), Some(16));

        let blocks = topology(&a.heap);
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].free && blocks[1].free);
        assert_eq!(blocks[1].size, 4096 - 2 * HEADER_SIZE - 16);
    }

    #[test]
    fn small_remainders_are_not_split() {
        let mut a = arena(4096);
        let whole = 4096 - HEADER_SIZE;
        // Remainder would be exactly header + minimum payload: no split.
        let p = a.heap.kmalloc(whole - HEADER_SIZE - MIN_BLOCK_SIZE).unwrap();
        assert_eq!(topology(&a.heap).len(), 1);
        assert_eq!(a.heap.usable_size(p.as_ptr()), Some(whole));
    }

    #[test]
    fn exact_size_reuse_restores_topology() {
        let mut a = arena(8192);
        let first = a.heap.kmalloc(64).unwrap();
        let _guard = a.heap.kmalloc(64).unwrap();
        a.heap.kfree(first.as_ptr()).unwrap();
        let before = topology(&a.heap);

        let again = a.heap.kmalloc(64).unwrap();
        assert_eq!(again, first);
        a.heap.kfree(again.as_ptr()).unwrap();
        assert_eq!(topology(&a.heap), before);
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut a = arena(8192);
        let x = a.heap.kmalloc(100).unwrap();
        let y = a.heap.kmalloc(100).unwrap();
        let z = a.heap.kmalloc(100).unwrap();

        a.heap.kfree(x.as_ptr()).unwrap();
        a.heap.kfree(z.as_ptr()).unwrap();
        a.heap.kfree(y.as_ptr()).unwrap();

        let blocks = topology(&a.heap);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].free);
        assert_eq!(blocks[0].size, 8192 - HEADER_SIZE);
    }

    #[test]
    fn repeated_free_is_detected_and_harmless() {
        let mut a = arena(8192);
        let p = a.heap.kmalloc(48).unwrap();
        let live = a.heap.kmalloc(48).unwrap();
        unsafe { ptr::write_bytes(live.as_ptr(), 0xA5, 48) };

        a.heap.kfree(p.as_ptr()).unwrap();
        let before = topology(&a.heap);
        assert_eq!(a.heap.kfree(p.as_ptr()), Err(KernelError::DoubleFree));
        assert_eq!(topology(&a.heap), before);
        assert_eq!(a.heap.stats().double_frees, 1);

        let q = a.heap.kmalloc(48).unwrap();
        let (q_start, live_start) = (q.as_ptr() as usize, live.as_ptr() as usize);
        assert!(q_start + 48 <= live_start || q_start >= live_start + 48);
        let bytes = unsafe { core::slice::from_raw_parts(live.as_ptr(), 48) };
        assert!(bytes.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn free_of_merged_block_is_double_free() {
        let mut a = arena(8192);
        let x = a.heap.kmalloc(64).unwrap();
        let y = a.heap.kmalloc(64).unwrap();
        a.heap.kfree(x.as_ptr()).unwrap();
        a.heap.kfree(y.as_ptr()).unwrap();
        // `y`'s header was absorbed into `x`.
        assert_eq!(a.heap.kfree(y.as_ptr()), Err(KernelError::DoubleFree));
    }

    #[test]
    fn foreign_pointer_is_invalid() {
        let mut a = arena(4096);
        let mut local = 0u64;
        assert_eq!(
            a.heap.kfree(&mut local as *mut u64 as *mut u8),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(a.heap.kfree(ptr::null_mut()), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn realloc_semantics() {
        let mut a = arena(8192);
        let p = a.heap.krealloc(None, 32).unwrap().unwrap();
        unsafe { ptr::copy_nonoverlapping(b"nucleus!".as_ptr(), p.as_ptr(), 8) };

        // Shrinking or staying within the block keeps the pointer.
        assert_eq!(a.heap.krealloc(Some(p), 24).unwrap(), Some(p));

        let _blocker = a.heap.kmalloc(16).unwrap();
        let q = a.heap.krealloc(Some(p), 256).unwrap().unwrap();
        assert_ne!(q, p);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 8) };
        assert_eq!(bytes, b"nucleus!");
        assert_eq!(a.heap.usable_size(p.as_ptr()), None);

        assert_eq!(a.heap.krealloc(Some(q), 0), Ok(None));
        assert_eq!(a.heap.usable_size(q.as_ptr()), None);
    }

    #[test]
    fn realloc_beyond_arena_keeps_block() {
        let mut a = arena(4096);
        let p = a.heap.kmalloc(64).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0x5A, 64) };
        let before = topology(&a.heap);

        assert_eq!(
            a.heap.krealloc(Some(p), usize::MAX),
            Err(KernelError::ResourceExhausted)
        );
        assert_eq!(
            a.heap.krealloc(Some(p), 4096 + 1),
            Err(KernelError::ResourceExhausted)
        );
        assert_eq!(topology(&a.heap), before);
        assert_eq!(a.heap.usable_size(p.as_ptr()), Some(64));
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let mut a = arena(4096);
        let p = a.heap.kmalloc(64).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xFF, 64) };
        a.heap.kfree(p.as_ptr()).unwrap();

        let q = a.heap.kcalloc(8, 8).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(a.heap.kcalloc(usize::MAX, 2), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn stats_account_for_every_byte() {
        let mut a = arena(8192);
        let _x = a.heap.kmalloc(100).unwrap();
        let _y = a.heap.kmalloc(200).unwrap();
        let s = a.heap.stats();
        assert_eq!(s.used_blocks, 2);
        assert_eq!(s.free_blocks, 1);
        assert_eq!(
            s.used_bytes + s.free_bytes + (s.used_blocks + s.free_blocks) * HEADER_SIZE,
            8192
        );
    }

    #[test]
    fn global_adapter_honours_large_alignment() {
        let locked = LockedHeap::empty();
        let mut buf = vec![0u64; 4096 / 8];
        unsafe { locked.init(buf.as_mut_ptr() as usize, 4096).unwrap() };

        let layout = Layout::from_size_align(100, 64).unwrap();
        let p = unsafe { locked.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        unsafe { locked.dealloc(p, layout) };

        let s = locked.with(|h| Ok(h.stats())).unwrap();
        assert_eq!(s.used_blocks, 0);
        drop(buf);
    }
}
