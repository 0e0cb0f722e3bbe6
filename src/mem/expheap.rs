/*
 * Expanded Heap
 *
 * General-purpose allocator with two intrusive block lists (free, used).
 * Allocation is first-fit or best-fit, from either end of the heap
 * (negative alignment allocates from the end). Alignment waste can be
 * returned to the free list or kept bundled with the allocation; the
 * block header records the leading waste so free() can reconstruct the
 * whole span. Freeing coalesces with adjacent free spans.
 */

use crate::guest::{GuestMemory, VirtAddr};
use crate::mem::{self, HeapFlags, HeapTag, MemHeapHeader};
use crate::Core;

const FREE_TAG: u16 = 0x4652; // "FR"
const USED_TAG: u16 = 0x5544; // "UD"

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum ExpHeapMode {
    FirstFit = 0,
    BestFit = 1,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExpHeapDirection {
    FromStart,
    FromEnd,
}

guest_struct! {
    pub struct MemExpHeapBlock : 0x14 {
        0x00 => attribs, set_attribs: u32;
        0x04 => block_size, set_block_size: u32;
        0x08 => prev, set_prev: addr;
        0x0C => next, set_next: addr;
        0x10 => tag, set_tag: u16;
    }
}

guest_struct! {
    pub struct MemExpHeapBlockList : 0x08 {
        0x00 => head, set_head: addr;
        0x04 => tail, set_tail: addr;
    }
}

guest_struct! {
    pub struct MemExpHeap : 0x54 {
        0x00 => header: struct MemHeapHeader;
        0x40 => free_list: struct MemExpHeapBlockList;
        0x48 => used_list: struct MemExpHeapBlockList;
        0x50 => group_id, set_group_id: u16;
        0x52 => attribs, set_attribs: u16;
    }
}

// Block attribute bitfield: group id in the low byte, leading alignment
// waste in bits 8..31, allocation direction in bit 31.
fn attrib_group_id(attribs: u32) -> u16 {
    (attribs & 0xFF) as u16
}

fn attrib_alignment(attribs: u32) -> u32 {
    (attribs >> 8) & 0x7F_FFFF
}

fn attrib_direction(attribs: u32) -> ExpHeapDirection {
    if attribs >> 31 != 0 {
        ExpHeapDirection::FromEnd
    } else {
        ExpHeapDirection::FromStart
    }
}

fn make_attribs(group_id: u16, alignment: u32, dir: ExpHeapDirection) -> u32 {
    let dir_bit = match dir {
        ExpHeapDirection::FromStart => 0,
        ExpHeapDirection::FromEnd => 1u32,
    };
    (group_id as u32 & 0xFF) | ((alignment & 0x7F_FFFF) << 8) | (dir_bit << 31)
}

// Heap attribute bitfield: allocation mode in bit 0, reuse-align-space in
// bit 1.
fn heap_alloc_mode(attribs: u16) -> ExpHeapMode {
    if attribs & 1 != 0 {
        ExpHeapMode::BestFit
    } else {
        ExpHeapMode::FirstFit
    }
}

fn heap_reuse_align_space(attribs: u16) -> bool {
    attribs & 2 != 0
}

fn block_mem_start(mem: &GuestMemory, block: MemExpHeapBlock) -> VirtAddr {
    VirtAddr(block.addr().0 - attrib_alignment(block.attribs(mem)))
}

fn block_mem_end(mem: &GuestMemory, block: MemExpHeapBlock) -> VirtAddr {
    block.addr().offset(MemExpHeapBlock::SIZE + block.block_size(mem))
}

fn block_data_start(block: MemExpHeapBlock) -> VirtAddr {
    block.addr().offset(MemExpHeapBlock::SIZE)
}

fn block_from_data(mem: &GuestMemory, data: VirtAddr) -> MemExpHeapBlock {
    let block = MemExpHeapBlock(VirtAddr(data.0 - MemExpHeapBlock::SIZE));
    assert!(block.tag(mem) == USED_TAG, "expanded heap block tag mismatch");
    block
}

fn list_contains(mem: &GuestMemory, list: MemExpHeapBlockList, block: MemExpHeapBlock) -> bool {
    let mut it = list.head(mem);
    while !it.is_null() {
        if it == block.addr() {
            return true;
        }
        it = MemExpHeapBlock(it).next(mem);
    }
    false
}

/// Insert `block` after `prev` (or at the head when `prev` is null).
fn insert_block(
    mem: &GuestMemory,
    list: MemExpHeapBlockList,
    prev: VirtAddr,
    block: MemExpHeapBlock,
) {
    debug_assert!(block.prev(mem).is_null());
    debug_assert!(block.next(mem).is_null());

    if prev.is_null() {
        block.set_next(mem, list.head(mem));
        block.set_prev(mem, VirtAddr::NULL);
        list.set_head(mem, block.addr());
    } else {
        let p = MemExpHeapBlock(prev);
        block.set_next(mem, p.next(mem));
        block.set_prev(mem, prev);
        p.set_next(mem, block.addr());
    }

    let next = block.next(mem);
    if next.is_null() {
        list.set_tail(mem, block.addr());
    } else {
        MemExpHeapBlock(next).set_prev(mem, block.addr());
    }
}

fn remove_block(mem: &GuestMemory, list: MemExpHeapBlockList, block: MemExpHeapBlock) {
    debug_assert!(list_contains(mem, list, block));

    let prev = block.prev(mem);
    let next = block.next(mem);

    if prev.is_null() {
        list.set_head(mem, next);
    } else {
        MemExpHeapBlock(prev).set_next(mem, next);
    }

    if next.is_null() {
        list.set_tail(mem, prev);
    } else {
        MemExpHeapBlock(next).set_prev(mem, prev);
    }

    block.set_prev(mem, VirtAddr::NULL);
    block.set_next(mem, VirtAddr::NULL);
}

/// Usable bytes in a free block once its data start (or end) is aligned.
fn aligned_block_size(
    mem: &GuestMemory,
    block: MemExpHeapBlock,
    alignment: u32,
    dir: ExpHeapDirection,
) -> u32 {
    let data_start = block_data_start(block);
    let data_end = data_start.offset(block.block_size(mem));

    match dir {
        ExpHeapDirection::FromStart => {
            let aligned = data_start.align_up(alignment);
            if aligned >= data_end {
                0
            } else {
                data_end.0 - aligned.0
            }
        }
        ExpHeapDirection::FromEnd => {
            let aligned = data_end.align_down(alignment);
            if aligned <= data_start {
                0
            } else {
                aligned.0 - data_start.0
            }
        }
    }
}

fn create_used_block_from_free_block(
    core: &Core<'_>,
    heap: MemExpHeap,
    free_block: MemExpHeapBlock,
    size: u32,
    alignment: u32,
    dir: ExpHeapDirection,
) -> MemExpHeapBlock {
    let mem = core.mem();
    let heap_attribs = heap.attribs(mem);

    let free_block_prev = free_block.prev(mem);
    let free_mem_start = block_mem_start(mem, free_block);
    let free_mem_end = block_mem_end(mem, free_block);

    // Free blocks never carry alignment waste
    debug_assert!(attrib_alignment(free_block.attribs(mem)) == 0);
    remove_block(mem, heap.free_list(), free_block);

    let aligned_data_start = match dir {
        ExpHeapDirection::FromStart => {
            free_mem_start.offset(MemExpHeapBlock::SIZE).align_up(alignment)
        }
        ExpHeapDirection::FromEnd => VirtAddr(free_mem_end.0 - size).align_down(alignment),
    };

    let aligned_block = MemExpHeapBlock(VirtAddr(aligned_data_start.0 - MemExpHeapBlock::SIZE));
    assert!(aligned_block.addr() >= free_mem_start);
    assert!(aligned_data_start.offset(size) <= free_mem_end);

    let mut top_space_remain = aligned_block.addr().0 - free_mem_start.0;
    let mut bottom_space_remain = free_mem_end.0 - aligned_data_start.0 - size;

    if heap_reuse_align_space(heap_attribs) || dir == ExpHeapDirection::FromEnd {
        // Give the leading waste back to the free list when it can hold a
        // worthwhile block
        if top_space_remain > MemExpHeapBlock::SIZE + 4 {
            let new_free = MemExpHeapBlock(free_mem_start);
            new_free.set_attribs(mem, 0);
            new_free.set_block_size(mem, top_space_remain - MemExpHeapBlock::SIZE);
            new_free.set_next(mem, VirtAddr::NULL);
            new_free.set_prev(mem, VirtAddr::NULL);
            new_free.set_tag(mem, FREE_TAG);
            insert_block(mem, heap.free_list(), free_block_prev, new_free);
            top_space_remain = 0;
        }
    }

    if heap_reuse_align_space(heap_attribs) || dir == ExpHeapDirection::FromStart {
        if bottom_space_remain > MemExpHeapBlock::SIZE + 4 {
            let new_free = MemExpHeapBlock(VirtAddr(free_mem_end.0 - bottom_space_remain));
            new_free.set_attribs(mem, 0);
            new_free.set_block_size(mem, bottom_space_remain - MemExpHeapBlock::SIZE);
            new_free.set_next(mem, VirtAddr::NULL);
            new_free.set_prev(mem, VirtAddr::NULL);
            new_free.set_tag(mem, FREE_TAG);
            insert_block(mem, heap.free_list(), free_block_prev, new_free);
            bottom_space_remain = 0;
        }
    }

    aligned_block.set_attribs(mem, make_attribs(heap.group_id(mem), top_space_remain, dir));
    aligned_block.set_block_size(mem, size + bottom_space_remain);
    aligned_block.set_prev(mem, VirtAddr::NULL);
    aligned_block.set_next(mem, VirtAddr::NULL);
    aligned_block.set_tag(mem, USED_TAG);

    insert_block(mem, heap.used_list(), VirtAddr::NULL, aligned_block);

    let flags = heap.header().flags(mem);
    if flags.contains(HeapFlags::ZERO_ALLOCATED) {
        mem.fill(aligned_data_start, size, 0);
    } else if flags.contains(HeapFlags::DEBUG_MODE) {
        let fill = core.heap_fill_value(mem::HeapFillType::Allocated);
        mem.fill(aligned_data_start, size, fill as u8);
    }

    aligned_block
}

/// Return the span [mem_start, mem_end) to the free list, coalescing with
/// its address-order neighbours.
fn release_memory(core: &Core<'_>, heap: MemExpHeap, mem_start: VirtAddr, mem_end: VirtAddr) {
    let mem = core.mem();
    debug_assert!(mem_end.0 - mem_start.0 >= MemExpHeapBlock::SIZE + 4);

    if heap.header().flags(mem).contains(HeapFlags::DEBUG_MODE) {
        let fill = core.heap_fill_value(mem::HeapFillType::Freed);
        mem.fill(mem_start, mem_end.0 - mem_start.0, fill as u8);
    }

    // The free list is address ordered: find our predecessor
    let mut prev_block = VirtAddr::NULL;
    let mut next_block = heap.free_list().head(mem);

    let mut it = heap.free_list().head(mem);
    while !it.is_null() {
        let candidate = MemExpHeapBlock(it);
        if block_mem_start(mem, candidate) < mem_start {
            prev_block = it;
            next_block = candidate.next(mem);
        } else {
            break;
        }
        it = candidate.next(mem);
    }

    let mut free_block = MemExpHeapBlock::NULL;
    if !prev_block.is_null() {
        let prev = MemExpHeapBlock(prev_block);
        if block_mem_end(mem, prev) == mem_start {
            // Absorb the released span into the predecessor
            prev.set_block_size(mem, prev.block_size(mem) + (mem_end.0 - mem_start.0));
            free_block = prev;
        }
    }

    if free_block.is_null() {
        free_block = MemExpHeapBlock(mem_start);
        free_block.set_attribs(mem, 0);
        free_block.set_block_size(mem, (mem_end.0 - mem_start.0) - MemExpHeapBlock::SIZE);
        free_block.set_next(mem, VirtAddr::NULL);
        free_block.set_prev(mem, VirtAddr::NULL);
        free_block.set_tag(mem, FREE_TAG);
        insert_block(mem, heap.free_list(), prev_block, free_block);
    }

    if !next_block.is_null() {
        let next = MemExpHeapBlock(next_block);
        if block_mem_start(mem, next) == mem_end {
            let next_end = block_mem_end(mem, next);
            free_block.set_block_size(
                mem,
                free_block.block_size(mem) + (next_end.0 - block_mem_start(mem, next).0),
            );
            remove_block(mem, heap.free_list(), next);
        }
    }
}

impl<'k> Core<'k> {
    /// Create an expanded heap over `[base, base + size)`.
    pub fn create_exp_heap(&self, base: VirtAddr, size: u32, flags: HeapFlags) -> Option<MemHeapHeader> {
        let mem = self.mem();

        let aligned_start = base.align_up(4);
        let aligned_end = base.offset(size).align_down(4);

        if aligned_end <= aligned_start || aligned_end.0 - aligned_start.0 < 0x6C {
            // Not enough room for the header and one block
            return None;
        }

        let heap = MemExpHeap(aligned_start);
        mem::register_heap(
            self,
            heap.header(),
            HeapTag::ExpandedHeap,
            aligned_start.offset(MemExpHeap::SIZE),
            aligned_end,
            flags,
        );

        let data_start = aligned_start.offset(MemExpHeap::SIZE);
        let first_block = MemExpHeapBlock(data_start);
        first_block.set_attribs(mem, 0);
        first_block.set_block_size(mem, (aligned_end.0 - data_start.0) - MemExpHeapBlock::SIZE);
        first_block.set_next(mem, VirtAddr::NULL);
        first_block.set_prev(mem, VirtAddr::NULL);
        first_block.set_tag(mem, FREE_TAG);

        heap.free_list().set_head(mem, first_block.addr());
        heap.free_list().set_tail(mem, first_block.addr());
        heap.used_list().set_head(mem, VirtAddr::NULL);
        heap.used_list().set_tail(mem, VirtAddr::NULL);

        heap.set_group_id(mem, 0);
        heap.set_attribs(mem, 0);

        Some(MemHeapHeader(heap.addr()))
    }

    pub fn destroy_exp_heap(&self, handle: MemHeapHeader) -> VirtAddr {
        let heap = MemExpHeap(handle.addr());
        assert!(heap.header().tag_raw(self.mem()) == HeapTag::ExpandedHeap as u32);
        mem::unregister_heap(self, heap.header());
        heap.addr()
    }

    /// Allocate `size` bytes. Positive alignment allocates from the start
    /// of the heap, negative from the end.
    pub fn alloc_from_exp_heap(&self, handle: MemHeapHeader, size: u32, alignment: i32) -> VirtAddr {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::ExpandedHeap as u32);
        assert!(alignment != 0, "alignment of zero");

        let size = if size == 0 { 1 } else { size };
        let size = (size + 3) & !3;
        let mode = heap_alloc_mode(heap.attribs(mem));

        let _guard = mem::lock_heap(self, heap.header());

        let (align, dir) = if alignment > 0 {
            ((alignment as u32).max(4), ExpHeapDirection::FromStart)
        } else {
            (((-alignment) as u32).max(4), ExpHeapDirection::FromEnd)
        };
        assert!(align % 4 == 0, "unaligned expanded heap alignment");

        let mut found = MemExpHeapBlock::NULL;
        let mut best_aligned_size = u32::MAX;

        let mut it = heap.free_list().head(mem);
        while !it.is_null() {
            let block = MemExpHeapBlock(it);
            let aligned_size = aligned_block_size(mem, block, align, dir);

            if aligned_size >= size {
                if mode == ExpHeapMode::FirstFit {
                    found = block;
                    break;
                } else if aligned_size < best_aligned_size {
                    found = block;
                    best_aligned_size = aligned_size;
                }
            }

            it = block.next(mem);
        }

        if found.is_null() {
            self.dump_heap(handle);
            return VirtAddr::NULL;
        }

        let new_block = create_used_block_from_free_block(self, heap, found, size, align, dir);
        block_data_start(new_block)
    }

    pub fn free_to_exp_heap(&self, handle: MemHeapHeader, block: VirtAddr) {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::ExpandedHeap as u32);

        if block.is_null() {
            return;
        }

        let _guard = mem::lock_heap(self, heap.header());

        let used = MemExpHeapBlock(VirtAddr(block.0 - MemExpHeapBlock::SIZE));
        let mem_start = block_mem_start(mem, used);
        let mem_end = block_mem_end(mem, used);

        remove_block(mem, heap.used_list(), used);
        release_memory(self, heap, mem_start, mem_end);
    }

    pub fn set_exp_heap_alloc_mode(&self, handle: MemHeapHeader, mode: ExpHeapMode) -> ExpHeapMode {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());

        let old = heap.attribs(mem);
        heap.set_attribs(mem, (old & !1) | mode as u16);
        heap_alloc_mode(old)
    }

    pub fn exp_heap_alloc_mode(&self, handle: MemHeapHeader) -> ExpHeapMode {
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());
        heap_alloc_mode(heap.attribs(self.mem()))
    }

    pub fn set_exp_heap_reuse_align_space(&self, handle: MemHeapHeader, reuse: bool) -> bool {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());

        let old = heap.attribs(mem);
        heap.set_attribs(mem, (old & !2) | if reuse { 2 } else { 0 });
        heap_reuse_align_space(old)
    }

    /// Shrink the heap, releasing the trailing free block's space.
    /// Returns the heap's new total size, or 0 if it cannot shrink.
    pub fn adjust_exp_heap(&self, handle: MemHeapHeader) -> u32 {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());

        let last = heap.free_list().tail(mem);
        if last.is_null() {
            return 0;
        }
        let last = MemExpHeapBlock(last);

        let block_data = block_data_start(last);
        if block_data.offset(last.block_size(mem)) != heap.header().data_end(mem) {
            // The trailing free block does not reach the end of the heap
            return 0;
        }

        debug_assert!(last.next(mem).is_null());
        let prev = last.prev(mem);
        if prev.is_null() {
            heap.free_list().set_head(mem, VirtAddr::NULL);
        } else {
            MemExpHeapBlock(prev).set_next(mem, VirtAddr::NULL);
        }
        heap.free_list().set_tail(mem, prev);

        heap.header().set_data_end(mem, block_mem_start(mem, last));
        heap.header().data_end(mem).0 - heap.addr().0
    }

    /// Grow or shrink an allocation in place. Returns the resulting block
    /// size, or 0 on failure.
    pub fn resize_exp_heap_block(&self, handle: MemHeapHeader, data: VirtAddr, size: u32) -> u32 {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());
        let size = (size + 3) & !3;

        let block = block_from_data(mem, data);

        if size < block.block_size(mem) {
            let released = block.block_size(mem) - size;

            if released > MemExpHeapBlock::SIZE + 4 {
                let released_end = block_mem_end(mem, block);
                let released_start = VirtAddr(released_end.0 - released);
                block.set_block_size(mem, block.block_size(mem) - released);
                release_memory(self, heap, released_start, released_end);
            }
        } else if size > block.block_size(mem) {
            let block_end = block_mem_end(mem, block);
            let mut free_block = MemExpHeapBlock::NULL;

            let mut it = heap.free_list().head(mem);
            while !it.is_null() {
                let candidate = MemExpHeapBlock(it);
                let start = block_mem_start(mem, candidate);
                if start == block_end {
                    free_block = candidate;
                    break;
                }
                // Address ordered, so we can stop early
                if start > block_end {
                    break;
                }
                it = candidate.next(mem);
            }

            if free_block.is_null() {
                return 0;
            }

            let free_start = block_mem_start(mem, free_block);
            let free_end = block_mem_end(mem, free_block);
            let mut free_size = free_end.0 - free_start.0;

            remove_block(mem, heap.free_list(), free_block);

            let grown = size - block.block_size(mem);
            free_size -= grown;
            block.set_block_size(mem, size);

            let flags = heap.header().flags(mem);
            if flags.contains(HeapFlags::ZERO_ALLOCATED) {
                mem.fill(free_start, grown, 0);
            } else if flags.contains(HeapFlags::DEBUG_MODE) {
                let fill = self.heap_fill_value(mem::HeapFillType::Allocated);
                mem.fill(free_start, grown, fill as u8);
            }

            if free_size >= MemExpHeapBlock::SIZE + 4 {
                release_memory(self, heap, VirtAddr(free_end.0 - free_size), free_end);
            } else {
                block.set_block_size(mem, block.block_size(mem) + free_size);
            }
        }

        block.block_size(mem)
    }

    pub fn exp_heap_total_free_size(&self, handle: MemHeapHeader) -> u32 {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());

        let mut total = 0;
        let mut it = heap.free_list().head(mem);
        while !it.is_null() {
            total += MemExpHeapBlock(it).block_size(mem);
            it = MemExpHeapBlock(it).next(mem);
        }
        total
    }

    /// Largest single allocation possible at the given alignment.
    pub fn exp_heap_allocatable_size(&self, handle: MemHeapHeader, alignment: i32) -> u32 {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());

        let (align, dir) = if alignment > 0 {
            (alignment as u32, ExpHeapDirection::FromStart)
        } else {
            ((-alignment) as u32, ExpHeapDirection::FromEnd)
        };
        assert!(align % 4 == 0, "unaligned expanded heap alignment");

        let mut largest = 0;
        let mut it = heap.free_list().head(mem);
        while !it.is_null() {
            let aligned = aligned_block_size(mem, MemExpHeapBlock(it), align, dir);
            largest = largest.max(aligned);
            it = MemExpHeapBlock(it).next(mem);
        }
        largest
    }

    pub fn set_exp_heap_group_id(&self, handle: MemHeapHeader, id: u16) -> u16 {
        let mem = self.mem();
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());
        let old = heap.group_id(mem);
        heap.set_group_id(mem, id);
        old
    }

    pub fn exp_heap_group_id(&self, handle: MemHeapHeader) -> u16 {
        let heap = MemExpHeap(handle.addr());
        let _guard = mem::lock_heap(self, heap.header());
        heap.group_id(self.mem())
    }

    pub fn exp_heap_block_size(&self, data: VirtAddr) -> u32 {
        MemExpHeapBlock(VirtAddr(data.0 - MemExpHeapBlock::SIZE)).block_size(self.mem())
    }

    pub fn exp_heap_block_group_id(&self, data: VirtAddr) -> u16 {
        attrib_group_id(MemExpHeapBlock(VirtAddr(data.0 - MemExpHeapBlock::SIZE)).attribs(self.mem()))
    }

    pub fn exp_heap_block_direction(&self, data: VirtAddr) -> ExpHeapDirection {
        attrib_direction(MemExpHeapBlock(VirtAddr(data.0 - MemExpHeapBlock::SIZE)).attribs(self.mem()))
    }
}

pub(crate) fn dump(core: &Core<'_>, heap: MemExpHeap) {
    let mem = core.mem();
    let _guard = mem::lock_heap(core, heap.header());

    log::debug!("MemExpHeap({:#010x})", heap.addr().0);
    log::debug!("status address    size       group");

    let mut it = heap.free_list().head(mem);
    while !it.is_null() {
        let block = MemExpHeapBlock(it);
        log::debug!(
            "FREE   {:#010x} {:#010x} {}",
            block.addr().0,
            block.block_size(mem),
            attrib_group_id(block.attribs(mem)),
        );
        it = block.next(mem);
    }

    let mut it = heap.used_list().head(mem);
    while !it.is_null() {
        let block = MemExpHeapBlock(it);
        log::debug!(
            "USED   {:#010x} {:#010x} {}",
            block.addr().0,
            block.block_size(mem),
            attrib_group_id(block.attribs(mem)),
        );
        it = block.next(mem);
    }
}
