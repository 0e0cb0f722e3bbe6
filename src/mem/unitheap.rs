/*
 * Unit Heap
 *
 * Fixed-size block allocator: a singly linked free list threaded through
 * the free blocks themselves.
 */

use crate::guest::VirtAddr;
use crate::mem::{self, HeapFlags, HeapTag, MemHeapHeader};
use crate::Core;

guest_struct! {
    pub struct MemUnitHeapFreeBlock : 0x04 {
        0x00 => next, set_next: addr;
    }
}

guest_struct! {
    pub struct MemUnitHeap : 0x48 {
        0x00 => header: struct MemHeapHeader;
        0x40 => free_blocks, set_free_blocks: addr;
        0x44 => block_size, set_block_size: u32;
    }
}

impl<'k> Core<'k> {
    /// Create a unit heap carved into blocks of `block_size` aligned to
    /// `alignment`.
    pub fn create_unit_heap(
        &self,
        base: VirtAddr,
        size: u32,
        block_size: u32,
        alignment: u32,
        flags: HeapFlags,
    ) -> Option<MemHeapHeader> {
        let mem = self.mem();

        let start = base.align_up(4);
        let end = base.offset(size).align_down(4);
        if start >= end {
            return None;
        }

        let data_start = start.offset(MemUnitHeap::SIZE).align_up(alignment);
        if data_start >= end {
            return None;
        }

        let aligned_block_size = (block_size + alignment - 1) & !(alignment - 1);
        let block_count = (end.0 - data_start.0) / aligned_block_size;
        if block_count == 0 {
            return None;
        }

        let heap = MemUnitHeap(start);
        mem::register_heap(
            self,
            heap.header(),
            HeapTag::UnitHeap,
            data_start,
            data_start.offset(aligned_block_size * block_count),
            flags,
        );

        heap.set_free_blocks(mem, data_start);
        heap.set_block_size(mem, aligned_block_size);

        // Thread the free list through the blocks
        let mut prev = MemUnitHeapFreeBlock::NULL;
        for i in 0..block_count {
            let block = MemUnitHeapFreeBlock(data_start.offset(aligned_block_size * i));
            if !prev.is_null() {
                prev.set_next(mem, block.addr());
            }
            prev = block;
        }
        if !prev.is_null() {
            prev.set_next(mem, VirtAddr::NULL);
        }

        Some(MemHeapHeader(heap.addr()))
    }

    pub fn destroy_unit_heap(&self, handle: MemHeapHeader) -> VirtAddr {
        let heap = MemUnitHeap(handle.addr());
        assert!(heap.header().tag_raw(self.mem()) == HeapTag::UnitHeap as u32);
        mem::unregister_heap(self, heap.header());
        heap.addr()
    }

    pub fn alloc_from_unit_heap(&self, handle: MemHeapHeader) -> VirtAddr {
        let mem = self.mem();
        let heap = MemUnitHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::UnitHeap as u32);

        let mut guard = mem::lock_heap(self, heap.header());
        let block = heap.free_blocks(mem);
        if !block.is_null() {
            heap.set_free_blocks(mem, MemUnitHeapFreeBlock(block).next(mem));
        }
        guard.unlock();

        if !block.is_null() {
            let flags = heap.header().flags(mem);
            if flags.contains(HeapFlags::ZERO_ALLOCATED) {
                mem.fill(block, heap.block_size(mem), 0);
            } else if flags.contains(HeapFlags::DEBUG_MODE) {
                let fill = self.heap_fill_value(mem::HeapFillType::Allocated);
                mem.fill(block, heap.block_size(mem), fill as u8);
            }
        }

        block
    }

    pub fn free_to_unit_heap(&self, handle: MemHeapHeader, block: VirtAddr) {
        let mem = self.mem();
        let heap = MemUnitHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::UnitHeap as u32);

        if block.is_null() {
            return;
        }

        if heap.header().flags(mem).contains(HeapFlags::DEBUG_MODE) {
            let fill = self.heap_fill_value(mem::HeapFillType::Freed);
            mem.fill(block, heap.block_size(mem), fill as u8);
        }

        let _guard = mem::lock_heap(self, heap.header());
        let free = MemUnitHeapFreeBlock(block);
        free.set_next(mem, heap.free_blocks(mem));
        heap.set_free_blocks(mem, block);
    }

    pub fn unit_heap_free_block_count(&self, handle: MemHeapHeader) -> u32 {
        let mem = self.mem();
        let heap = MemUnitHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::UnitHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());
        let mut count = 0;
        let mut it = heap.free_blocks(mem);
        while !it.is_null() {
            count += 1;
            it = MemUnitHeapFreeBlock(it).next(mem);
        }
        count
    }
}

/// Total bytes needed for a unit heap of `block_count` blocks.
pub fn calc_heap_size(block_size: u32, block_count: u32, alignment: u32) -> u32 {
    let aligned_block_size = (block_size + alignment - 1) & !(alignment - 1);
    let header_size = alignment - 4 + MemUnitHeap::SIZE;
    header_size + aligned_block_size * block_count
}

pub(crate) fn dump(core: &Core<'_>, heap: MemUnitHeap) {
    let mem = core.mem();
    let handle = MemHeapHeader(heap.addr());
    let free_blocks = core.unit_heap_free_block_count(handle);
    let free_size = heap.block_size(mem) * free_blocks;
    let total_size = heap.header().data_end(mem).0 - heap.header().data_start(mem).0;
    let used_size = total_size - free_size;

    log::debug!("MemUnitHeap({:#010x})", heap.addr().0);
    log::debug!("{used_size} out of {total_size} bytes used");
}
