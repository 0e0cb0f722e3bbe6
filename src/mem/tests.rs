use super::expheap::{ExpHeapMode, MemExpHeap, MemExpHeapBlock};
use super::frameheap::{FrameHeapFreeMode, MemFrameHeap};
use super::*;
use crate::guest::VirtAddr;
use crate::testkit::TestKernel;

fn exp_free_block_count(t: &TestKernel, heap: MemHeapHeader) -> u32 {
    let mem = t.k.mem();
    let h = MemExpHeap(heap.addr());
    let mut count = 0;
    let mut it = h.free_list().head(mem);
    while !it.is_null() {
        count += 1;
        it = MemExpHeapBlock(it).next(mem);
    }
    count
}

#[test]
fn exp_heap_alloc_free_returns_to_one_block() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();
    let initial_free = core.exp_heap_total_free_size(heap);
    assert_eq!(exp_free_block_count(&t, heap), 1);

    let a = core.alloc_from_exp_heap(heap, 100, 4);
    let b = core.alloc_from_exp_heap(heap, 500, 4);
    let c = core.alloc_from_exp_heap(heap, 0x1000, 4);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    // Free in a scrambled order; coalescing restores a single span
    core.free_to_exp_heap(heap, b);
    core.free_to_exp_heap(heap, a);
    core.free_to_exp_heap(heap, c);
    assert_eq!(core.exp_heap_total_free_size(heap), initial_free);
    assert_eq!(exp_free_block_count(&t, heap), 1);
}

#[test]
fn exp_heap_best_fit_takes_the_tightest_hole() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x100000, 4);
    let heap = core.create_exp_heap(base, 0x100000, HeapFlags::empty()).unwrap();
    core.set_exp_heap_alloc_mode(heap, ExpHeapMode::BestFit);

    let _a = core.alloc_from_exp_heap(heap, 100, 4);
    let b = core.alloc_from_exp_heap(heap, 500, 4);
    let _c = core.alloc_from_exp_heap(heap, 100, 4);
    core.free_to_exp_heap(heap, b);

    // The 500-byte hole is a tighter fit than the tail
    let d = core.alloc_from_exp_heap(heap, 400, 4);
    assert_eq!(d, b);
}

#[test]
fn exp_heap_first_fit_takes_the_first_hole() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    let a = core.alloc_from_exp_heap(heap, 0x200, 4);
    let _hold = core.alloc_from_exp_heap(heap, 0x200, 4);
    core.free_to_exp_heap(heap, a);

    // First fit reuses the hole at the front even for a smaller request
    let d = core.alloc_from_exp_heap(heap, 0x100, 4);
    assert_eq!(d, a);
}

#[test]
fn exp_heap_negative_alignment_allocates_from_the_end() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();
    let data_end = heap.data_end(mem);

    let a = core.alloc_from_exp_heap(heap, 0x100, -4);
    assert_eq!(a, VirtAddr(data_end.0 - 0x100));

    // And the front is still free for a forward allocation
    let b = core.alloc_from_exp_heap(heap, 0x100, 4);
    assert!(b < a);
}

#[test]
fn exp_heap_respects_large_alignment() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    let a = core.alloc_from_exp_heap(heap, 100, 0x40);
    assert_eq!(a.0 % 0x40, 0);
    // The block remembers its size
    assert_eq!(core.exp_heap_block_size(a), 100);
}

#[test]
fn exp_heap_exhaustion_returns_null() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x1000, 4);
    let heap = core.create_exp_heap(base, 0x1000, HeapFlags::empty()).unwrap();
    assert!(core.alloc_from_exp_heap(heap, 0x2000, 4).is_null());
}

#[test]
fn exp_heap_resize_in_place() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    let a = core.alloc_from_exp_heap(heap, 0x100, 4);
    // Grow into the free space behind the block
    assert_eq!(core.resize_exp_heap_block(heap, a, 0x300), 0x300);
    assert_eq!(core.exp_heap_block_size(a), 0x300);
    // Shrink gives the tail back
    assert_eq!(core.resize_exp_heap_block(heap, a, 0x40), 0x40);

    // A following allocation cannot grow into another block
    let _b = core.alloc_from_exp_heap(heap, 0x100, 4);
    let fenced = core.alloc_from_exp_heap(heap, 0x40, 4);
    let _c = core.alloc_from_exp_heap(heap, 0x100, 4);
    assert_eq!(core.resize_exp_heap_block(heap, fenced, 0x1000), 0);
}

#[test]
fn exp_heap_adjust_releases_the_tail() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();
    let _a = core.alloc_from_exp_heap(heap, 0x100, 4);

    let new_size = core.adjust_exp_heap(heap);
    assert!(new_size > 0);
    assert_eq!(heap.data_end(mem).0, heap.addr().0 + new_size);
    assert_eq!(core.exp_heap_total_free_size(heap), 0);
}

#[test]
fn exp_heap_group_ids_tag_blocks() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    assert_eq!(core.set_exp_heap_group_id(heap, 7), 0);
    let a = core.alloc_from_exp_heap(heap, 0x40, 4);
    assert_eq!(core.exp_heap_block_group_id(a), 7);
    assert_eq!(core.exp_heap_group_id(heap), 7);
}

#[test]
fn frame_heap_state_records_round_trip() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_frm_heap(base, 0x10000, HeapFlags::empty()).unwrap();
    let frm = MemFrameHeap(heap.addr());

    let a1 = core.alloc_from_frm_heap(heap, 0x100, 4);
    let a2 = core.alloc_from_frm_heap(heap, 0x100, -4);
    assert!(!a1.is_null() && !a2.is_null());

    assert!(core.record_frm_heap_state(heap, 0x5454));
    let head_at_record = frm.head(mem);
    let tail_at_record = frm.tail(mem);

    core.alloc_from_frm_heap(heap, 0x400, 4);
    core.alloc_from_frm_heap(heap, 0x400, -4);
    assert_ne!(frm.head(mem), head_at_record);

    assert!(core.free_by_state_to_frm_heap(heap, 0x5454));
    assert_eq!(frm.head(mem), head_at_record);
    assert_eq!(frm.tail(mem), tail_at_record);

    // No matching record left
    assert!(!core.free_by_state_to_frm_heap(heap, 0x5454));
}

#[test]
fn frame_heap_free_modes_reset_each_end() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_frm_heap(base, 0x10000, HeapFlags::empty()).unwrap();
    let frm = MemFrameHeap(heap.addr());

    core.alloc_from_frm_heap(heap, 0x100, 4);
    core.alloc_from_frm_heap(heap, 0x100, -4);

    core.free_to_frm_heap(heap, FrameHeapFreeMode::HEAD);
    assert_eq!(frm.head(mem), heap.data_start(mem));
    assert_ne!(frm.tail(mem), heap.data_end(mem));

    core.free_to_frm_heap(heap, FrameHeapFreeMode::TAIL);
    assert_eq!(frm.tail(mem), heap.data_end(mem));
}

#[test]
fn frame_heap_bump_directions_and_exhaustion() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x1000, 4);
    let heap = core.create_frm_heap(base, 0x1000, HeapFlags::empty()).unwrap();
    let frm = MemFrameHeap(heap.addr());

    let head = core.alloc_from_frm_heap(heap, 0x100, 8);
    assert_eq!(head, heap.data_start(mem).align_up(8));
    let tail = core.alloc_from_frm_heap(heap, 0x100, -8);
    assert_eq!(tail, VirtAddr(heap.data_end(mem).0 - 0x100).align_down(8));
    assert!(frm.head(mem) <= frm.tail(mem));

    // No room for the rest
    assert!(core.alloc_from_frm_heap(heap, 0x10000, 4).is_null());
}

#[test]
fn unit_heap_fixed_blocks() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x1000, 4);
    let heap = core.create_unit_heap(base, 0x1000, 48, 8, HeapFlags::empty()).unwrap();

    let total = core.unit_heap_free_block_count(heap);
    assert!(total > 0);

    let a = core.alloc_from_unit_heap(heap);
    let b = core.alloc_from_unit_heap(heap);
    assert_eq!(b.0 - a.0, 48); // aligned block stride
    assert_eq!(core.unit_heap_free_block_count(heap), total - 2);

    // Free list is LIFO
    core.free_to_unit_heap(heap, a);
    assert_eq!(core.alloc_from_unit_heap(heap), a);

    // Drain to exhaustion
    while !core.alloc_from_unit_heap(heap).is_null() {}
    assert_eq!(core.unit_heap_free_block_count(heap), 0);
}

#[test]
fn block_heap_alloc_at_carves_the_span() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let heap_block = t.alloc(MemBlockHeap::SIZE, 4);
    let region = t.alloc(0x4000, 4);
    let tracking = t.alloc(0x200, 4);

    let heap = core
        .init_block_heap(
            heap_block,
            region,
            region.offset(0x4000),
            MemBlockHeapTracking(tracking),
            0x200,
            HeapFlags::empty(),
        )
        .unwrap();

    let before = core.block_heap_tracking_left(heap);
    let pinned = core.alloc_from_block_heap_at(heap, region.offset(0x1000), 0x100);
    assert_eq!(pinned, region.offset(0x1000));
    // A head and a tail free record were carved out
    assert_eq!(core.block_heap_tracking_left(heap), before - 2);
    assert_eq!(core.block_heap_total_free_size(heap), 0x4000 - 0x100);

    // The pinned span cannot be claimed again
    assert!(core.alloc_from_block_heap_at(heap, region.offset(0x1000), 0x10).is_null());

    core.free_to_block_heap(heap, pinned);
    // Merging returned both records to the pool
    assert_eq!(core.block_heap_tracking_left(heap), before);
    assert_eq!(core.block_heap_total_free_size(heap), 0x4000);
}

#[test]
fn block_heap_directional_allocation() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let heap_block = t.alloc(MemBlockHeap::SIZE, 4);
    let region = t.alloc(0x4000, 4);
    let tracking = t.alloc(0x200, 4);
    let heap = core
        .init_block_heap(
            heap_block,
            region,
            region.offset(0x4000),
            MemBlockHeapTracking(tracking),
            0x200,
            HeapFlags::empty(),
        )
        .unwrap();

    let front = core.alloc_from_block_heap(heap, 0x100, 4);
    assert_eq!(front, region);

    let back = core.alloc_from_block_heap(heap, 0x100, -4);
    assert_eq!(back, region.offset(0x4000 - 0x100));
}

#[test]
fn block_heap_needs_tracking_records_to_split() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let heap_block = t.alloc(MemBlockHeap::SIZE, 4);
    let region = t.alloc(0x1000, 4);
    // Room for exactly one extra tracking record
    let tracking = t.alloc(MemBlockHeapTracking::SIZE + MemBlockHeapBlock::SIZE, 4);
    let heap = core
        .init_block_heap(
            heap_block,
            region,
            region.offset(0x1000),
            MemBlockHeapTracking(tracking),
            MemBlockHeapTracking::SIZE + MemBlockHeapBlock::SIZE,
            HeapFlags::empty(),
        )
        .unwrap();

    assert_eq!(core.block_heap_tracking_left(heap), 1);
    // A middle allocation needs two records; only one is available
    assert!(core.alloc_from_block_heap_at(heap, region.offset(0x100), 0x100).is_null());
    // An allocation flush to the start needs only one
    assert_eq!(core.alloc_from_block_heap_at(heap, region, 0x100), region);
}

#[test]
fn find_containing_heap_resolves_pointers() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    let a = core.alloc_from_exp_heap(heap, 0x100, 4);
    assert_eq!(core.find_containing_heap(a), Some(heap));
    assert_eq!(core.find_containing_heap(VirtAddr(t.k.layout().mem1_start)), None);

    core.destroy_exp_heap(heap);
    assert_eq!(core.find_containing_heap(a), None);
}

#[test]
fn base_heap_arena_handles() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    assert!(core.base_heap_handle(BaseHeapType::Mem2).is_none());
    assert!(core.set_base_heap_handle(BaseHeapType::Mem2, heap).is_none());
    assert_eq!(core.base_heap_handle(BaseHeapType::Mem2), Some(heap));
    assert_eq!(core.heap_arena(heap), Some(BaseHeapType::Mem2));
}

#[test]
fn debug_mode_fills_memory() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::DEBUG_MODE).unwrap();

    // Unused fill from registration
    assert_eq!(mem.read_u8(heap.data_start(mem).offset(0x20)), 0xC3);

    let a = core.alloc_from_exp_heap(heap, 0x40, 4);
    assert_eq!(mem.read_u8(a), 0xF3);

    core.free_to_exp_heap(heap, a);
    assert_eq!(mem.read_u8(a), 0xD3);
}

#[test]
fn zero_allocated_heaps_clear_memory() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::ZERO_ALLOCATED).unwrap();

    let a = core.alloc_from_exp_heap(heap, 0x40, 4);
    mem.write_u32(a, 0x12345678);
    core.free_to_exp_heap(heap, a);

    let b = core.alloc_from_exp_heap(heap, 0x40, 4);
    assert_eq!(b, a);
    assert_eq!(mem.read_u32(b), 0);
}

#[test]
fn heap_fill_values_are_configurable() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    assert_eq!(core.heap_fill_value(HeapFillType::Unused), 0xC3C3_C3C3);
    assert_eq!(core.heap_fill_value(HeapFillType::Allocated), 0xF3F3_F3F3);
    assert_eq!(core.heap_fill_value(HeapFillType::Freed), 0xD3D3_D3D3);

    core.set_heap_fill_value(HeapFillType::Freed, 0xAAAA_AAAA);
    assert_eq!(core.heap_fill_value(HeapFillType::Freed), 0xAAAA_AAAA);
}

#[test]
fn allocator_facade_dispatches_to_the_heap() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    let allocator = allocator::MemAllocator(t.alloc(allocator::MemAllocator::SIZE, 4));
    core.init_allocator_for_exp_heap(allocator, heap, 4);

    let a = core.alloc_from_allocator(allocator, 0x100);
    assert!(!a.is_null());
    assert!(a > heap.data_start(mem) && a < heap.data_end(mem));

    core.free_to_allocator(allocator, a);
    // Freed memory is reusable
    assert_eq!(core.alloc_from_allocator(allocator, 0x100), a);
}

#[test]
fn default_heap_allocator_uses_the_mem2_arena() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_exp_heap(base, 0x10000, HeapFlags::empty()).unwrap();
    core.set_base_heap_handle(BaseHeapType::Mem2, heap);

    let allocator = allocator::MemAllocator(t.alloc(allocator::MemAllocator::SIZE, 4));
    core.init_allocator_for_default_heap(allocator);

    let a = core.alloc_from_allocator(allocator, 0x80);
    assert!(!a.is_null());
    assert_eq!(a.0 % 0x40, 0);
    core.free_to_allocator(allocator, a);
}

#[test]
fn frame_heap_allocator_free_leaks_by_design_of_the_console() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let base = t.alloc(0x10000, 4);
    let heap = core.create_frm_heap(base, 0x10000, HeapFlags::empty()).unwrap();

    let allocator = allocator::MemAllocator(t.alloc(allocator::MemAllocator::SIZE, 4));
    core.init_allocator_for_frm_heap(allocator, heap, 4);

    let before = core.frm_heap_allocatable_size(heap, 4);
    let a = core.alloc_from_allocator(allocator, 0x100);
    assert!(!a.is_null());
    core.free_to_allocator(allocator, a);
    // Nothing came back
    assert!(core.frm_heap_allocatable_size(heap, 4) < before);
}

#[test]
fn system_heap_round_trip() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let before = core.system_heap_free_size();
    let a = core.alloc_from_system(0x100, 4);
    assert!(!a.is_null());
    assert!(core.system_heap_free_size() < before);

    core.free_to_system(a);
    assert_eq!(core.system_heap_free_size(), before);
}

#[test]
fn user_heap_registration() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let block = t.alloc(0x1000, 4);
    let heap = core.create_user_heap_handle(MemHeapHeader(block), 0x800);
    let inside = block.offset(MemHeapHeader::SIZE + 0x10);
    assert_eq!(core.find_containing_heap(inside), Some(heap));
}
