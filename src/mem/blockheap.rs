/*
 * Block Heap
 *
 * Span allocator with external tracking: the heap's data region is
 * described by an address-ordered list of block records, each marking a
 * free or used span. Records come from a pre-allocated pool refilled with
 * `add_block_heap_tracking`. `alloc_from_block_heap_at` can pin an
 * allocation to an exact address by carving the containing free span.
 */

use crate::guest::{GuestMemory, VirtAddr};
use crate::mem::{self, HeapFlags, HeapTag, MemHeapHeader};
use crate::Core;

guest_struct! {
    pub struct MemBlockHeapTracking : 0x10 {
        0x08 => blocks, set_blocks: addr;
        0x0C => block_count, set_block_count: u32;
    }
}

guest_struct! {
    pub struct MemBlockHeapBlock : 0x14 {
        0x00 => start, set_start: addr;
        0x04 => end, set_end: addr;
        0x08 => is_free, set_is_free: u32;
        0x0C => prev, set_prev: addr;
        0x10 => next, set_next: addr;
    }
}

guest_struct! {
    pub struct MemBlockHeap : 0x74 {
        0x00 => header: struct MemHeapHeader;
        0x40 => default_track: struct MemBlockHeapTracking;
        0x50 => default_block: struct MemBlockHeapBlock;
        0x64 => first_block, set_first_block: addr;
        0x68 => last_block, set_last_block: addr;
        0x6C => first_free_block, set_first_free_block: addr;
        0x70 => num_free_blocks, set_num_free_blocks: u32;
    }
}

/// Find the block record whose span contains `addr`, searching from
/// whichever end of the list is closer.
fn find_block_owning(mem: &GuestMemory, heap: MemBlockHeap, addr: VirtAddr) -> MemBlockHeapBlock {
    if addr < heap.header().data_start(mem) || addr >= heap.header().data_end(mem) {
        return MemBlockHeapBlock::NULL;
    }

    let dist_from_start = addr.0 - heap.header().data_start(mem).0;
    let dist_from_end = heap.header().data_end(mem).0 - addr.0;

    if dist_from_start < dist_from_end {
        let mut it = heap.first_block(mem);
        while !it.is_null() {
            let block = MemBlockHeapBlock(it);
            if block.end(mem) > addr {
                return block;
            }
            it = block.next(mem);
        }
    } else {
        let mut it = heap.last_block(mem);
        while !it.is_null() {
            let block = MemBlockHeapBlock(it);
            if block.start(mem) <= addr {
                return block;
            }
            it = block.prev(mem);
        }
    }

    MemBlockHeapBlock::NULL
}

/// Carve `[start, start + size)` out of a free block, splitting off head
/// and tail free records as needed. The block becomes used.
fn alloc_inside_block(
    core: &Core<'_>,
    heap: MemBlockHeap,
    block: MemBlockHeapBlock,
    start: VirtAddr,
    size: u32,
) -> bool {
    let mem = core.mem();
    let end = start.offset(size);

    if size == 0 || end > block.end(mem) {
        return false;
    }

    // Check the free-record pool can cover the splits first
    let mut need_free_blocks = 0;
    if start != block.start(mem) {
        need_free_blocks += 1;
    }
    if end != block.end(mem) {
        need_free_blocks += 1;
    }
    if heap.num_free_blocks(mem) < need_free_blocks {
        return false;
    }

    if start != block.start(mem) {
        let free_block = MemBlockHeapBlock(heap.first_free_block(mem));
        heap.set_first_free_block(mem, free_block.next(mem));
        heap.set_num_free_blocks(mem, heap.num_free_blocks(mem) - 1);

        free_block.set_start(mem, block.start(mem));
        free_block.set_end(mem, start);
        free_block.set_is_free(mem, 1);
        free_block.set_prev(mem, block.prev(mem));
        free_block.set_next(mem, block.addr());

        if !free_block.prev(mem).is_null() {
            MemBlockHeapBlock(free_block.prev(mem)).set_next(mem, free_block.addr());
        } else {
            heap.set_first_block(mem, free_block.addr());
        }

        block.set_start(mem, start);
        block.set_prev(mem, free_block.addr());
    }

    if end != block.end(mem) {
        let free_block = MemBlockHeapBlock(heap.first_free_block(mem));
        heap.set_first_free_block(mem, free_block.next(mem));
        heap.set_num_free_blocks(mem, heap.num_free_blocks(mem) - 1);

        free_block.set_start(mem, end);
        free_block.set_end(mem, block.end(mem));
        free_block.set_is_free(mem, 1);
        free_block.set_prev(mem, block.addr());
        free_block.set_next(mem, block.next(mem));

        if !block.next(mem).is_null() {
            MemBlockHeapBlock(block.next(mem)).set_prev(mem, free_block.addr());
        } else {
            heap.set_last_block(mem, free_block.addr());
        }

        block.set_end(mem, end);
        block.set_next(mem, free_block.addr());
    }

    let flags = heap.header().flags(mem);
    if flags.contains(HeapFlags::ZERO_ALLOCATED) {
        mem.fill(block.start(mem), size, 0);
    } else if flags.contains(HeapFlags::DEBUG_MODE) {
        let fill = core.heap_fill_value(mem::HeapFillType::Allocated);
        mem.fill(block.start(mem), size, fill as u8);
    }

    block.set_is_free(mem, 0);
    true
}

impl<'k> Core<'k> {
    /// Initialise a block heap over `[start, end)` with an initial
    /// tracking pool.
    pub fn init_block_heap(
        &self,
        base: VirtAddr,
        start: VirtAddr,
        end: VirtAddr,
        tracking: MemBlockHeapTracking,
        tracking_size: u32,
        flags: HeapFlags,
    ) -> Option<MemHeapHeader> {
        let mem = self.mem();
        let heap = MemBlockHeap(base);
        if heap.is_null() || start.is_null() || end.is_null() || start >= end {
            return None;
        }

        mem::register_heap(self, heap.header(), HeapTag::BlockHeap, start, end, flags);

        heap.default_track().set_block_count(mem, 1);
        heap.default_track().set_blocks(mem, heap.default_block().addr());

        heap.default_block().set_start(mem, start);
        heap.default_block().set_end(mem, end);
        heap.default_block().set_is_free(mem, 1);
        heap.default_block().set_next(mem, VirtAddr::NULL);
        heap.default_block().set_prev(mem, VirtAddr::NULL);

        heap.set_first_block(mem, heap.default_block().addr());
        heap.set_last_block(mem, heap.default_block().addr());
        heap.set_first_free_block(mem, VirtAddr::NULL);
        heap.set_num_free_blocks(mem, 0);

        let handle = MemHeapHeader(heap.addr());
        self.add_block_heap_tracking(handle, tracking, tracking_size);
        Some(handle)
    }

    pub fn destroy_block_heap(&self, handle: MemHeapHeader) -> VirtAddr {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return VirtAddr::NULL;
        }

        mem::unregister_heap(self, heap.header());
        mem.fill(heap.addr(), MemBlockHeap::SIZE, 0);
        heap.addr()
    }

    /// Donate memory for more tracking records. Returns 0 on success,
    /// a negative error otherwise.
    pub fn add_block_heap_tracking(
        &self,
        handle: MemHeapHeader,
        tracking: MemBlockHeapTracking,
        size: u32,
    ) -> i32 {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || tracking.is_null() || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return -4;
        }

        // Needs room for the tracking descriptor and at least one record
        if size < MemBlockHeapTracking::SIZE + MemBlockHeapBlock::SIZE {
            return -4;
        }

        let block_count = (size - MemBlockHeapTracking::SIZE) / MemBlockHeapBlock::SIZE;
        let blocks = tracking.addr().offset(MemBlockHeapTracking::SIZE);

        tracking.set_block_count(mem, block_count);
        tracking.set_blocks(mem, blocks);

        for i in 0..block_count {
            let block = MemBlockHeapBlock(blocks.offset(i * MemBlockHeapBlock::SIZE));
            block.set_prev(mem, VirtAddr::NULL);
            block.set_next(mem, blocks.offset((i + 1) * MemBlockHeapBlock::SIZE));
        }

        let _guard = mem::lock_heap(self, heap.header());
        let last = MemBlockHeapBlock(blocks.offset((block_count - 1) * MemBlockHeapBlock::SIZE));
        last.set_next(mem, heap.first_free_block(mem));
        heap.set_first_free_block(mem, blocks);
        heap.set_num_free_blocks(mem, heap.num_free_blocks(mem) + block_count);
        0
    }

    /// Allocate at an exact address.
    pub fn alloc_from_block_heap_at(
        &self,
        handle: MemHeapHeader,
        addr: VirtAddr,
        size: u32,
    ) -> VirtAddr {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || addr.is_null() || size == 0
            || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32
        {
            return VirtAddr::NULL;
        }

        if heap.first_free_block(mem).is_null() {
            return VirtAddr::NULL;
        }

        let _guard = mem::lock_heap(self, heap.header());

        let block = find_block_owning(mem, heap, addr);
        if block.is_null() {
            log::warn!("alloc_from_block_heap_at: no block contains {addr}");
            return VirtAddr::NULL;
        }

        if block.is_free(mem) == 0 {
            log::warn!("alloc_from_block_heap_at: address {addr} is not free");
            return VirtAddr::NULL;
        }

        if !alloc_inside_block(self, heap, block, addr, size) {
            return VirtAddr::NULL;
        }

        addr
    }

    /// First-fit allocation; negative alignment searches from the end.
    pub fn alloc_from_block_heap(&self, handle: MemHeapHeader, size: u32, align: i32) -> VirtAddr {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || size == 0 || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return VirtAddr::NULL;
        }

        let _guard = mem::lock_heap(self, heap.header());
        let align = if align == 0 { 4 } else { align };

        let mut found = MemBlockHeapBlock::NULL;
        let mut aligned_start = VirtAddr::NULL;

        if align >= 0 {
            let mut it = heap.first_block(mem);
            while !it.is_null() {
                let block = MemBlockHeapBlock(it);
                if block.is_free(mem) != 0 {
                    let start = block.start(mem).align_up(align as u32);
                    if start.offset(size) < block.end(mem) {
                        found = block;
                        aligned_start = start;
                        break;
                    }
                }
                it = block.next(mem);
            }
        } else {
            let mut it = heap.last_block(mem);
            while !it.is_null() {
                let block = MemBlockHeapBlock(it);
                if block.is_free(mem) != 0 {
                    let start = VirtAddr(block.end(mem).0 - size).align_down((-align) as u32);
                    if start >= block.start(mem) {
                        found = block;
                        aligned_start = start;
                        break;
                    }
                }
                it = block.prev(mem);
            }
        }

        if found.is_null() {
            log::warn!(
                "alloc_from_block_heap: no free span for size {size:#x} align {align:#x}"
            );
            return VirtAddr::NULL;
        }

        if !alloc_inside_block(self, heap, found, aligned_start, size) {
            return VirtAddr::NULL;
        }

        aligned_start
    }

    /// Free a span, merging with free neighbours and returning spare
    /// records to the pool.
    pub fn free_to_block_heap(&self, handle: MemHeapHeader, data: VirtAddr) {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || data.is_null() || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return;
        }

        let _guard = mem::lock_heap(self, heap.header());
        let mut block = find_block_owning(mem, heap, data);

        if block.is_null() {
            log::warn!("free_to_block_heap: no block contains {data}");
            return;
        }

        if block.is_free(mem) != 0 {
            log::warn!("free_to_block_heap: block is already free");
            return;
        }

        if block.start(mem) != data {
            log::warn!(
                "free_to_block_heap: tried to free {:#010x} from the middle at {data}",
                block.start(mem).0
            );
            return;
        }

        if heap.header().flags(mem).contains(HeapFlags::DEBUG_MODE) {
            let fill = self.heap_fill_value(mem::HeapFillType::Freed);
            mem.fill(block.start(mem), block.end(mem).0 - block.start(mem).0, fill as u8);
        }

        // Merge with the previous record when it is free
        let prev = block.prev(mem);
        if !prev.is_null() {
            let prev = MemBlockHeapBlock(prev);
            if prev.is_free(mem) != 0 {
                prev.set_end(mem, block.end(mem));
                prev.set_next(mem, block.next(mem));

                let next = prev.next(mem);
                if !next.is_null() {
                    MemBlockHeapBlock(next).set_prev(mem, prev.addr());
                } else {
                    heap.set_last_block(mem, prev.addr());
                }

                block.set_prev(mem, VirtAddr::NULL);
                block.set_next(mem, heap.first_free_block(mem));
                heap.set_num_free_blocks(mem, heap.num_free_blocks(mem) + 1);
                heap.set_first_free_block(mem, block.addr());

                block = prev;
            }
        }

        block.set_is_free(mem, 1);

        // And with the next record
        let next = block.next(mem);
        if !next.is_null() {
            let next = MemBlockHeapBlock(next);
            if next.is_free(mem) != 0 {
                block.set_end(mem, next.end(mem));
                block.set_next(mem, next.next(mem));

                if !next.next(mem).is_null() {
                    MemBlockHeapBlock(next.next(mem)).set_prev(mem, block.addr());
                } else {
                    heap.set_last_block(mem, block.addr());
                }

                next.set_next(mem, heap.first_free_block(mem));
                heap.set_first_free_block(mem, next.addr());
                heap.set_num_free_blocks(mem, heap.num_free_blocks(mem) + 1);
            }
        }
    }

    pub fn block_heap_allocatable_size(&self, handle: MemHeapHeader, align: i32) -> u32 {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return 0;
        }

        let _guard = mem::lock_heap(self, heap.header());
        let align = match align {
            0 => 4u32,
            a if a < 0 => (-a) as u32,
            a => a as u32,
        };

        let mut best = 0;
        let mut it = heap.first_block(mem);
        while !it.is_null() {
            let block = MemBlockHeapBlock(it);
            if block.is_free(mem) != 0 {
                let aligned = block.start(mem).align_up(align);
                if aligned < block.end(mem) {
                    best = best.max(block.end(mem).0 - aligned.0);
                }
            }
            it = block.next(mem);
        }
        best
    }

    /// Tracking records still available in the pool.
    pub fn block_heap_tracking_left(&self, handle: MemHeapHeader) -> u32 {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return 0;
        }
        heap.num_free_blocks(mem)
    }

    pub fn block_heap_total_free_size(&self, handle: MemHeapHeader) -> u32 {
        let mem = self.mem();
        let heap = MemBlockHeap(handle.addr());
        if heap.is_null() || heap.header().tag_raw(mem) != HeapTag::BlockHeap as u32 {
            return 0;
        }

        let _guard = mem::lock_heap(self, heap.header());
        let mut total = 0;
        let mut it = heap.first_block(mem);
        while !it.is_null() {
            let block = MemBlockHeapBlock(it);
            if block.is_free(mem) != 0 {
                total += block.end(mem).0 - block.start(mem).0;
            }
            it = block.next(mem);
        }
        total
    }
}
