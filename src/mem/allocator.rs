/*
 * Allocator Facade
 *
 * A uniform alloc/free function-pair interface over the heap family.
 * The function pairs are guest function pointers so that guest code can
 * call through an allocator it received from anywhere; ours point at
 * builtin functions backed by the heap implementations.
 */

use crate::guest::VirtAddr;
use crate::mem::{BaseHeapType, MemHeapHeader};
use crate::{Core, Kernel};

guest_struct! {
    pub struct MemAllocatorFunctions : 0x08 {
        0x00 => alloc, set_alloc: addr;
        0x04 => free, set_free: addr;
    }
}

guest_struct! {
    pub struct MemAllocator : 0x10 {
        0x00 => funcs, set_funcs: addr;
        0x04 => heap, set_heap: addr;
        0x08 => align, set_align: i32;
    }
}

/// Index of each function pair in the allocator static table.
#[derive(Copy, Clone)]
enum Funcs {
    DefaultHeap = 0,
    BlockHeap = 1,
    ExpHeap = 2,
    FrameHeap = 3,
    UnitHeap = 4,
}

fn funcs_addr(k: &Kernel, which: Funcs) -> VirtAddr {
    k.statics.allocator_fns.offset(which as u32 * MemAllocatorFunctions::SIZE)
}

impl<'k> Core<'k> {
    pub fn init_allocator_for_default_heap(&self, allocator: MemAllocator) {
        let mem = self.mem();
        let heap = self.base_heap_handle(BaseHeapType::Mem2);
        allocator.set_heap(mem, heap.map_or(VirtAddr::NULL, |h| h.addr()));
        allocator.set_align(mem, 0);
        allocator.set_funcs(mem, funcs_addr(self.k, Funcs::DefaultHeap));
    }

    pub fn init_allocator_for_block_heap(
        &self,
        allocator: MemAllocator,
        heap: MemHeapHeader,
        align: i32,
    ) {
        let mem = self.mem();
        allocator.set_heap(mem, heap.addr());
        allocator.set_align(mem, align);
        allocator.set_funcs(mem, funcs_addr(self.k, Funcs::BlockHeap));
    }

    pub fn init_allocator_for_exp_heap(
        &self,
        allocator: MemAllocator,
        heap: MemHeapHeader,
        align: i32,
    ) {
        let mem = self.mem();
        allocator.set_heap(mem, heap.addr());
        allocator.set_align(mem, align);
        allocator.set_funcs(mem, funcs_addr(self.k, Funcs::ExpHeap));
    }

    pub fn init_allocator_for_frm_heap(
        &self,
        allocator: MemAllocator,
        heap: MemHeapHeader,
        align: i32,
    ) {
        let mem = self.mem();
        allocator.set_heap(mem, heap.addr());
        allocator.set_align(mem, align);
        allocator.set_funcs(mem, funcs_addr(self.k, Funcs::FrameHeap));
    }

    pub fn init_allocator_for_unit_heap(&self, allocator: MemAllocator, heap: MemHeapHeader) {
        let mem = self.mem();
        allocator.set_heap(mem, heap.addr());
        allocator.set_align(mem, 0);
        allocator.set_funcs(mem, funcs_addr(self.k, Funcs::UnitHeap));
    }

    pub fn alloc_from_allocator(&self, allocator: MemAllocator, size: u32) -> VirtAddr {
        let mem = self.mem();
        let funcs = MemAllocatorFunctions(allocator.funcs(mem));
        let alloc = funcs.alloc(mem);
        VirtAddr(self.k.invoke_guest(self.id, alloc, [allocator.addr().0, size, 0, 0]))
    }

    pub fn free_to_allocator(&self, allocator: MemAllocator, block: VirtAddr) {
        let mem = self.mem();
        let funcs = MemAllocatorFunctions(allocator.funcs(mem));
        let free = funcs.free(mem);
        self.k.invoke_guest(self.id, free, [allocator.addr().0, block.0, 0, 0]);
    }

    /// Allocate from the default (MEM2 arena) heap.
    pub fn alloc_from_default_heap(&self, size: u32) -> VirtAddr {
        match self.base_heap_handle(BaseHeapType::Mem2) {
            Some(heap) => self.alloc_from_exp_heap(heap, size, 0x40),
            None => VirtAddr::NULL,
        }
    }

    pub fn free_to_default_heap(&self, block: VirtAddr) {
        if let Some(heap) = self.base_heap_handle(BaseHeapType::Mem2) {
            self.free_to_exp_heap(heap, block);
        }
    }
}

fn builtin_default_heap_alloc(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let _allocator = MemAllocator(VirtAddr(args[0]));
    k.core(core).alloc_from_default_heap(args[1]).0
}

fn builtin_default_heap_free(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let _allocator = MemAllocator(VirtAddr(args[0]));
    k.core(core).free_to_default_heap(VirtAddr(args[1]));
    0
}

fn builtin_block_heap_alloc(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.alloc_from_block_heap(heap, args[1], allocator.align(mem)).0
}

fn builtin_block_heap_free(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.free_to_block_heap(heap, VirtAddr(args[1]));
    0
}

fn builtin_exp_heap_alloc(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.alloc_from_exp_heap(heap, args[1], allocator.align(mem)).0
}

fn builtin_exp_heap_free(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.free_to_exp_heap(heap, VirtAddr(args[1]));
    0
}

fn builtin_frm_heap_alloc(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.alloc_from_frm_heap(heap, args[1], allocator.align(mem)).0
}

fn builtin_frm_heap_free(_k: &Kernel, _core: u32, _args: [u32; 4]) -> u32 {
    // Frame heap allocations cannot be freed individually; the console's
    // implementation leaks here as well.
    log::warn!("allocator did not free memory allocated from frame heap");
    0
}

fn builtin_unit_heap_alloc(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.alloc_from_unit_heap(heap).0
}

fn builtin_unit_heap_free(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let allocator = MemAllocator(VirtAddr(args[0]));
    let heap = MemHeapHeader(allocator.heap(mem));
    view.free_to_unit_heap(heap, VirtAddr(args[1]));
    0
}

pub(crate) fn initialise(k: &Kernel) {
    let mem = k.mem();
    let pairs: [(Funcs, crate::BuiltinFn, crate::BuiltinFn); 5] = [
        (Funcs::DefaultHeap, builtin_default_heap_alloc, builtin_default_heap_free),
        (Funcs::BlockHeap, builtin_block_heap_alloc, builtin_block_heap_free),
        (Funcs::ExpHeap, builtin_exp_heap_alloc, builtin_exp_heap_free),
        (Funcs::FrameHeap, builtin_frm_heap_alloc, builtin_frm_heap_free),
        (Funcs::UnitHeap, builtin_unit_heap_alloc, builtin_unit_heap_free),
    ];

    for (which, alloc, free) in pairs {
        let funcs = MemAllocatorFunctions(funcs_addr(k, which));
        funcs.set_alloc(mem, k.register_builtin(alloc));
        funcs.set_free(mem, k.register_builtin(free));
    }
}
