/*
 * Memory Heaps
 *
 * The heap family shares a common 0x40-byte header: a tag discriminating
 * the variant, a link into the region list it was registered in (MEM1,
 * MEM2 or the foreground bucket), a list of nested child heaps, the data
 * bounds, a spinlock and the creation flags. The registry lets
 * `find_containing_heap` resolve any guest pointer to the innermost heap
 * that owns it.
 */

pub mod allocator;
pub mod blockheap;
pub mod expheap;
pub mod frameheap;
pub mod list;
pub mod system_heap;
pub mod unitheap;

use bitflags::bitflags;

use crate::guest::VirtAddr;
use crate::sync::spinlock::OsSpinLock;
use crate::{Core, Kernel};

use self::list::{MemList, MemListLink};

pub use blockheap::{MemBlockHeap, MemBlockHeapBlock, MemBlockHeapTracking};
pub use expheap::{ExpHeapMode, MemExpHeap};
pub use frameheap::{FrameHeapFreeMode, MemFrameHeap};
pub use unitheap::MemUnitHeap;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum HeapTag {
    ExpandedHeap = 0x4558_5048, // "EXPH"
    FrameHeap = 0x4652_4D48,    // "FRMH"
    UnitHeap = 0x554E_5448,     // "UNTH"
    UserHeap = 0x5553_5248,     // "USRH"
    BlockHeap = 0x424C_4B48,    // "BLKH"
}

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct HeapFlags: u32 {
        const ZERO_ALLOCATED = 1 << 0;
        const DEBUG_MODE = 1 << 1;
        const THREAD_SAFE = 1 << 2;
    }
}

/// The three base-heap arenas.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BaseHeapType {
    Mem1 = 0,
    Mem2 = 1,
    Foreground = 2,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HeapFillType {
    Unused = 0,
    Allocated = 1,
    Freed = 2,
}

guest_struct! {
    pub struct MemHeapHeader : 0x40 {
        0x00 => tag_raw, set_tag_raw: u32;
        0x04 => link: struct MemListLink;
        0x0C => child_list: struct MemList;
        0x18 => data_start, set_data_start: addr;
        0x1C => data_end, set_data_end: addr;
        0x20 => lock: struct OsSpinLock;
        0x30 => flags_raw, set_flags_raw: u32;
    }
}

impl MemHeapHeader {
    pub fn flags(self, mem: &crate::guest::GuestMemory) -> HeapFlags {
        HeapFlags::from_bits_retain(self.flags_raw(mem))
    }
}

/// Offset of the registry link within a heap header.
const HEAP_LINK_OFFSET: u16 = 0x04;

/// Scoped hold of a heap's spinlock, taken only for ThreadSafe heaps.
pub(crate) struct HeapGuard<'a, 'k> {
    core: &'a Core<'k>,
    lock: Option<OsSpinLock>,
}

impl<'a, 'k> HeapGuard<'a, 'k> {
    pub fn unlock(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.core.uninterruptible_spin_lock_release(lock);
        }
    }
}

impl Drop for HeapGuard<'_, '_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

pub(crate) fn lock_heap<'a, 'k>(core: &'a Core<'k>, header: MemHeapHeader) -> HeapGuard<'a, 'k> {
    let mem = core.mem();
    if header.flags(mem).contains(HeapFlags::THREAD_SAFE) {
        core.uninterruptible_spin_lock_acquire(header.lock());
        HeapGuard { core, lock: Some(header.lock()) }
    } else {
        HeapGuard { core, lock: None }
    }
}

fn region_list(k: &Kernel, start: VirtAddr, end: VirtAddr) -> list::MemList {
    let layout = k.layout();
    let s = &k.statics.memheap;

    let fg_start = layout.foreground_start;
    let fg_end = fg_start + layout.foreground_size;
    if start.0 >= fg_start && end.0 <= fg_end {
        return list::MemList(s.foreground_list);
    }

    let m1_start = layout.mem1_start;
    let m1_end = m1_start + layout.mem1_size;
    if start.0 >= m1_start && end.0 <= m1_end {
        list::MemList(s.mem1_list)
    } else {
        list::MemList(s.mem2_list)
    }
}

fn region_list_for_block(k: &Kernel, block: VirtAddr) -> list::MemList {
    region_list(k, block, block)
}

pub(crate) fn register_heap(
    core: &Core<'_>,
    header: MemHeapHeader,
    tag: HeapTag,
    data_start: VirtAddr,
    data_end: VirtAddr,
    flags: HeapFlags,
) {
    let k = core.k;
    let mem = core.mem();

    header.set_tag_raw(mem, tag as u32);
    header.set_data_start(mem, data_start);
    header.set_data_end(mem, data_end);
    header.set_flags_raw(mem, flags.bits());

    if flags.contains(HeapFlags::DEBUG_MODE) {
        let fill = core.heap_fill_value(HeapFillType::Unused);
        mem.fill(data_start, data_end.0 - data_start.0, fill as u8);
    }

    list::init_list(mem, header.child_list(), HEAP_LINK_OFFSET);
    core.init_spin_lock(header.lock());

    let global = OsSpinLock(k.statics.memheap.lock);
    core.uninterruptible_spin_lock_acquire(global);
    let target = region_list(k, data_start, data_end);
    list::append_object(mem, target, header.addr());
    core.uninterruptible_spin_lock_release(global);
}

pub(crate) fn unregister_heap(core: &Core<'_>, header: MemHeapHeader) {
    let k = core.k;
    let mem = core.mem();

    let global = OsSpinLock(k.statics.memheap.lock);
    core.uninterruptible_spin_lock_acquire(global);
    let target = region_list(k, header.data_start(mem), header.data_end(mem));
    list::remove_object(mem, target, header.addr());
    core.uninterruptible_spin_lock_release(global);
}

fn find_heap_containing_block(
    core: &Core<'_>,
    haystack: list::MemList,
    block: VirtAddr,
) -> Option<MemHeapHeader> {
    let mem = core.mem();
    let mut it = list::next_object(mem, haystack, VirtAddr::NULL);

    while !it.is_null() {
        let heap = MemHeapHeader(it);
        if block >= heap.data_start(mem) && block < heap.data_end(mem) {
            let child = find_heap_containing_block(core, heap.child_list(), block);
            return Some(child.unwrap_or(heap));
        }
        it = list::next_object(mem, haystack, it);
    }

    None
}

impl<'k> Core<'k> {
    /// Find the innermost registered heap containing `block`.
    pub fn find_containing_heap(&self, block: VirtAddr) -> Option<MemHeapHeader> {
        let haystack = region_list_for_block(self.k, block);
        find_heap_containing_block(self, haystack, block)
    }

    pub fn base_heap_handle(&self, kind: BaseHeapType) -> Option<MemHeapHeader> {
        let addr = self.mem().read_addr(self.k.statics.memheap.arenas.offset(kind as u32 * 4));
        if addr.is_null() {
            None
        } else {
            Some(MemHeapHeader(addr))
        }
    }

    pub fn set_base_heap_handle(
        &self,
        kind: BaseHeapType,
        heap: MemHeapHeader,
    ) -> Option<MemHeapHeader> {
        let slot = self.k.statics.memheap.arenas.offset(kind as u32 * 4);
        let previous = self.mem().read_addr(slot);
        self.mem().write_addr(slot, heap.addr());
        if previous.is_null() {
            None
        } else {
            Some(MemHeapHeader(previous))
        }
    }

    /// Which arena a heap is registered as, if any.
    pub fn heap_arena(&self, heap: MemHeapHeader) -> Option<BaseHeapType> {
        for kind in [BaseHeapType::Mem1, BaseHeapType::Mem2, BaseHeapType::Foreground] {
            if self.base_heap_handle(kind) == Some(heap) {
                return Some(kind);
            }
        }
        None
    }

    /// Register a caller-managed heap of `size` data bytes.
    pub fn create_user_heap_handle(&self, header: MemHeapHeader, size: u32) -> MemHeapHeader {
        let data_start = header.addr().offset(MemHeapHeader::SIZE);
        register_heap(
            self,
            header,
            HeapTag::UserHeap,
            data_start,
            data_start.offset(size),
            HeapFlags::empty(),
        );
        header
    }

    pub fn heap_fill_value(&self, kind: HeapFillType) -> u32 {
        let lock = OsSpinLock(self.k.statics.memheap.lock);
        self.uninterruptible_spin_lock_acquire(lock);
        let v = self.mem().read_u32(self.k.statics.memheap.fill_values.offset(kind as u32 * 4));
        self.uninterruptible_spin_lock_release(lock);
        v
    }

    pub fn set_heap_fill_value(&self, kind: HeapFillType, value: u32) {
        let lock = OsSpinLock(self.k.statics.memheap.lock);
        self.uninterruptible_spin_lock_acquire(lock);
        self.mem().write_u32(self.k.statics.memheap.fill_values.offset(kind as u32 * 4), value);
        self.uninterruptible_spin_lock_release(lock);
    }

    /// Log the contents of a heap.
    pub fn dump_heap(&self, heap: MemHeapHeader) {
        match heap.tag_raw(self.mem()) {
            t if t == HeapTag::ExpandedHeap as u32 => expheap::dump(self, MemExpHeap(heap.addr())),
            t if t == HeapTag::UnitHeap as u32 => unitheap::dump(self, MemUnitHeap(heap.addr())),
            t => log::warn!("dump_heap: unimplemented for heap tag {t:08x}"),
        }
    }
}

pub(crate) fn initialise(k: &Kernel) {
    let core = k.core(crate::MAIN_CORE);
    let mem = k.mem();
    let s = &k.statics.memheap;

    core.init_spin_lock(OsSpinLock(s.lock));
    list::init_list(mem, list::MemList(s.foreground_list), HEAP_LINK_OFFSET);
    list::init_list(mem, list::MemList(s.mem1_list), HEAP_LINK_OFFSET);
    list::init_list(mem, list::MemList(s.mem2_list), HEAP_LINK_OFFSET);

    for arena in 0..3 {
        mem.write_addr(s.arenas.offset(arena * 4), VirtAddr::NULL);
    }

    mem.write_u32(s.fill_values.offset(0), 0xC3C3_C3C3);
    mem.write_u32(s.fill_values.offset(4), 0xF3F3_F3F3);
    mem.write_u32(s.fill_values.offset(8), 0xD3D3_D3D3);
}

#[cfg(test)]
mod tests;
