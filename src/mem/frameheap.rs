/*
 * Frame Heap
 *
 * Two-ended bump allocator: positive alignment bumps the head pointer up,
 * negative alignment bumps the tail pointer down. There is no per-block
 * free; instead the whole head or tail side is reset, or the heap is
 * rolled back to a recorded state. State records are allocated from the
 * frame itself and chained.
 */

use bitflags::bitflags;

use crate::guest::VirtAddr;
use crate::mem::{self, HeapFlags, HeapTag, MemHeapHeader};
use crate::Core;

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct FrameHeapFreeMode: u32 {
        const HEAD = 1 << 0;
        const TAIL = 1 << 1;
        const ALL = 0b11;
    }
}

guest_struct! {
    pub struct MemFrameHeapState : 0x10 {
        0x00 => tag, set_tag: u32;
        0x04 => head, set_head: addr;
        0x08 => tail, set_tail: addr;
        0x0C => previous, set_previous: addr;
    }
}

guest_struct! {
    pub struct MemFrameHeap : 0x4C {
        0x00 => header: struct MemHeapHeader;
        0x40 => head, set_head: addr;
        0x44 => tail, set_tail: addr;
        0x48 => previous_state, set_previous_state: addr;
    }
}

impl<'k> Core<'k> {
    pub fn create_frm_heap(&self, base: VirtAddr, size: u32, flags: HeapFlags) -> Option<MemHeapHeader> {
        let mem = self.mem();

        let start = base.align_up(4);
        let end = base.offset(size).align_down(4);

        if start >= end || end.0 - start.0 < MemFrameHeap::SIZE {
            return None;
        }

        let heap = MemFrameHeap(start);
        mem::register_heap(
            self,
            heap.header(),
            HeapTag::FrameHeap,
            start.offset(MemFrameHeap::SIZE),
            end,
            flags,
        );

        heap.set_head(mem, heap.header().data_start(mem));
        heap.set_tail(mem, heap.header().data_end(mem));
        heap.set_previous_state(mem, VirtAddr::NULL);
        Some(MemHeapHeader(heap.addr()))
    }

    pub fn destroy_frm_heap(&self, handle: MemHeapHeader) -> VirtAddr {
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(self.mem()) == HeapTag::FrameHeap as u32);
        mem::unregister_heap(self, heap.header());
        heap.addr()
    }

    /// Bump-allocate. Positive alignment takes from the head, negative
    /// from the tail.
    pub fn alloc_from_frm_heap(&self, handle: MemHeapHeader, size: u32, alignment: i32) -> VirtAddr {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let size = if size == 0 { 1 } else { size };

        let mut guard = mem::lock_heap(self, heap.header());
        let block;

        if alignment < 0 {
            let tail = VirtAddr(heap.tail(mem).0 - size).align_down((-alignment) as u32);
            if tail < heap.head(mem) {
                return VirtAddr::NULL;
            }
            heap.set_tail(mem, tail);
            block = tail;
        } else {
            let addr = heap.head(mem).align_up(alignment as u32);
            let head = addr.offset(size);
            if head > heap.tail(mem) {
                return VirtAddr::NULL;
            }
            heap.set_head(mem, head);
            block = addr;
        }

        guard.unlock();

        let flags = heap.header().flags(mem);
        if flags.contains(HeapFlags::ZERO_ALLOCATED) {
            mem.fill(block, size, 0);
        } else if flags.contains(HeapFlags::DEBUG_MODE) {
            let fill = self.heap_fill_value(mem::HeapFillType::Allocated);
            mem.fill(block, size, fill as u8);
        }

        block
    }

    /// Reset the head and/or tail side, dropping all state records.
    pub fn free_to_frm_heap(&self, handle: MemHeapHeader, mode: FrameHeapFreeMode) {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());
        let debug = heap.header().flags(mem).contains(HeapFlags::DEBUG_MODE);

        if mode.contains(FrameHeapFreeMode::HEAD) {
            if debug {
                let fill = self.heap_fill_value(mem::HeapFillType::Freed);
                let start = heap.header().data_start(mem);
                mem.fill(start, heap.head(mem).0 - start.0, fill as u8);
            }
            heap.set_head(mem, heap.header().data_start(mem));
            heap.set_previous_state(mem, VirtAddr::NULL);
        }

        if mode.contains(FrameHeapFreeMode::TAIL) {
            if debug {
                let fill = self.heap_fill_value(mem::HeapFillType::Freed);
                let tail = heap.tail(mem);
                mem.fill(tail, heap.header().data_end(mem).0 - tail.0, fill as u8);
            }
            heap.set_tail(mem, heap.header().data_end(mem));
            heap.set_previous_state(mem, VirtAddr::NULL);
        }
    }

    /// Snapshot the head/tail pointers under a user tag.
    pub fn record_frm_heap_state(&self, handle: MemHeapHeader, tag: u32) -> bool {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());

        // The record itself lives in the frame
        let state_addr = self.alloc_from_frm_heap(handle, MemFrameHeapState::SIZE, 4);
        if state_addr.is_null() {
            return false;
        }

        let state = MemFrameHeapState(state_addr);
        state.set_tag(mem, tag);
        state.set_head(mem, heap.head(mem));
        state.set_tail(mem, heap.tail(mem));
        state.set_previous(mem, heap.previous_state(mem));
        heap.set_previous_state(mem, state.addr());
        true
    }

    /// Roll back to the newest state record matching `tag` (0 matches the
    /// newest record of all).
    pub fn free_by_state_to_frm_heap(&self, handle: MemHeapHeader, tag: u32) -> bool {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());

        let mut state = MemFrameHeapState(heap.previous_state(mem));
        if tag != 0 {
            while !state.is_null() {
                if state.tag(mem) == tag {
                    break;
                }
                state = MemFrameHeapState(state.previous(mem));
            }
        }

        if state.is_null() {
            return false;
        }

        if heap.header().flags(mem).contains(HeapFlags::DEBUG_MODE) {
            let fill = self.heap_fill_value(mem::HeapFillType::Freed);
            mem.fill(state.head(mem), heap.head(mem).0 - state.head(mem).0, fill as u8);
            mem.fill(heap.tail(mem), state.tail(mem).0 - heap.tail(mem).0, fill as u8);
        }

        heap.set_head(mem, state.head(mem));
        heap.set_tail(mem, state.tail(mem));
        heap.set_previous_state(mem, state.previous(mem));
        true
    }

    /// Shrink the heap to its current head. Only legal with nothing
    /// allocated from the tail. Returns the heap's new total size.
    pub fn adjust_frm_heap(&self, handle: MemHeapHeader) -> u32 {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());

        if heap.tail(mem) != heap.header().data_end(mem) {
            return 0;
        }

        heap.header().set_data_end(mem, heap.head(mem));
        heap.set_tail(mem, heap.head(mem));
        heap.header().data_end(mem).0 - heap.addr().0
    }

    /// Resize the most recent head allocation in place. Returns the new
    /// size, or 0 on failure.
    pub fn resize_frm_heap_block(&self, handle: MemHeapHeader, address: VirtAddr, size: u32) -> u32 {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());

        debug_assert!(address < heap.head(mem));
        debug_assert!(address < heap.tail(mem));
        debug_assert!(
            heap.previous_state(mem).is_null() || heap.previous_state(mem) < address
        );

        let size = if size == 0 { 1 } else { size };
        let end = address.offset(size).align_up(4);
        let head = heap.head(mem);
        let flags = heap.header().flags(mem);

        if end > heap.tail(mem) {
            return 0;
        }

        if end == head {
            return size;
        }

        if end < head {
            if flags.contains(HeapFlags::DEBUG_MODE) {
                let fill = self.heap_fill_value(mem::HeapFillType::Freed);
                mem.fill(end, head.0 - end.0, fill as u8);
            }
            heap.set_head(mem, end);
            return size;
        }

        // Growing: fill the newly claimed span
        if flags.contains(HeapFlags::ZERO_ALLOCATED) {
            mem.fill(head, end.0 - head.0, 0);
        } else if flags.contains(HeapFlags::DEBUG_MODE) {
            let fill = self.heap_fill_value(mem::HeapFillType::Allocated);
            mem.fill(head, end.0 - head.0, fill as u8);
        }
        heap.set_head(mem, end);
        size
    }

    pub fn frm_heap_allocatable_size(&self, handle: MemHeapHeader, alignment: i32) -> u32 {
        let mem = self.mem();
        let heap = MemFrameHeap(handle.addr());
        assert!(heap.header().tag_raw(mem) == HeapTag::FrameHeap as u32);

        let _guard = mem::lock_heap(self, heap.header());
        let aligned_head = heap.head(mem).align_up(alignment.unsigned_abs());
        if aligned_head < heap.tail(mem) {
            heap.tail(mem).0 - aligned_head.0
        } else {
            0
        }
    }
}
