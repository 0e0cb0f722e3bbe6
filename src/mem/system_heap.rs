/*
 * System Heap
 *
 * A small expanded heap in the kernel-reserved region, used for
 * kernel-internal allocations such as handle subtables.
 */

use crate::guest::VirtAddr;
use crate::mem::{HeapFlags, MemHeapHeader};
use crate::{Core, Kernel, MAIN_CORE};

impl<'k> Core<'k> {
    pub fn alloc_from_system(&self, size: u32, align: i32) -> VirtAddr {
        let heap = MemHeapHeader(self.k.statics.system_heap_base);
        let ptr = self.alloc_from_exp_heap(heap, size, align);
        log::trace!("system heap alloc {size:#x} -> {ptr}");
        ptr
    }

    pub fn free_to_system(&self, ptr: VirtAddr) {
        let heap = MemHeapHeader(self.k.statics.system_heap_base);
        self.free_to_exp_heap(heap, ptr);
    }

    pub fn system_heap_free_size(&self) -> u32 {
        let heap = MemHeapHeader(self.k.statics.system_heap_base);
        self.exp_heap_total_free_size(heap)
    }
}

pub(crate) fn initialise(k: &Kernel) {
    let core = k.core(MAIN_CORE);
    let heap = core
        .create_exp_heap(
            k.statics.system_heap_base,
            k.statics.system_heap_size,
            HeapFlags::THREAD_SAFE,
        )
        .expect("system area too small for the system heap");
    debug_assert!(heap.addr() == k.statics.system_heap_base);
}
