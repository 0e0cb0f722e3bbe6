/*
 * Locked Cache
 *
 * Each core owns a 16 KiB scratchpad divided into 512-byte blocks tracked
 * by a 32-bit occupancy bitmask. An allocation claims a run of
 * consecutive blocks; the mask and byte size of each allocation are
 * remembered at its first block index so dealloc can undo it. DMA between
 * main memory and the scratchpad is emulated by an immediate copy.
 */

use bit_field::BitField;

use crate::guest::VirtAddr;
use crate::sync::mutex::OsMutex;
use crate::thread::ThreadAttributes;
use crate::{Core, Kernel};

pub const LC_BLOCK_SIZE: u32 = 512;
pub const LC_MAX_SIZE: u32 = 16 * 1024;
pub(crate) const LC_STATE_SIZE: u32 = 0x154;

// Per-core state block layout.
const OFF_MUTEX: u32 = 0x00;
const OFF_BASE: u32 = 0x44;
const OFF_FREE_SIZE: u32 = 0x48;
const OFF_ALLOC_MASK: u32 = 0x4C;
const OFF_MASKS: u32 = 0x50;
const OFF_SIZES: u32 = 0xD0;
const OFF_DMA_REFS: u32 = 0x150;

struct LcState(VirtAddr);

impl LcState {
    fn mutex(&self) -> OsMutex {
        OsMutex(self.0.offset(OFF_MUTEX))
    }
}

fn state(k: &Kernel, core: u32) -> LcState {
    LcState(k.statics.locked_cache[core as usize])
}

impl<'k> Core<'k> {
    /// Whether the locked cache hardware is usable from this core.
    pub fn lc_hardware_available(&self) -> bool {
        // Cores 0 and 1 need the foreground; core 2 always has it
        self.id == 2 || self.k.layout().foreground_size > 0
    }

    /// Allocate `size` bytes (rounded up to whole blocks) from this
    /// core's locked cache.
    pub fn lc_alloc(&self, size: u32) -> VirtAddr {
        if size > LC_MAX_SIZE {
            return VirtAddr::NULL;
        }

        let mem = self.mem();
        let st = state(self.k, self.id);
        let mut result = VirtAddr::NULL;
        self.lock_mutex(st.mutex());

        if mem.read_u32(st.0.offset(OFF_FREE_SIZE)) >= size {
            let num_blocks = (size + LC_BLOCK_SIZE - 1) / LC_BLOCK_SIZE;
            let bit_mask = if num_blocks >= 32 { u32::MAX } else { (1 << num_blocks) - 1 };
            let alloc_mask = mem.read_u32(st.0.offset(OFF_ALLOC_MASK));

            // Lowest run of num_blocks clear bits
            let mut found = None;
            for index in 0..=(32 - num_blocks) {
                if alloc_mask & (bit_mask << index) == 0 {
                    found = Some(index);
                    break;
                }
            }

            if let Some(index) = found {
                let mask = bit_mask << index;
                let bytes = num_blocks * LC_BLOCK_SIZE;

                mem.write_u32(st.0.offset(OFF_ALLOC_MASK), alloc_mask | mask);
                let free = mem.read_u32(st.0.offset(OFF_FREE_SIZE));
                mem.write_u32(st.0.offset(OFF_FREE_SIZE), free - bytes);

                mem.write_u32(st.0.offset(OFF_MASKS + index * 4), mask);
                mem.write_u32(st.0.offset(OFF_SIZES + index * 4), bytes);

                let base = mem.read_u32(st.0.offset(OFF_BASE));
                result = VirtAddr(base + index * LC_BLOCK_SIZE);
            }
        }

        self.unlock_mutex(st.mutex());
        result
    }

    /// Return an allocation to this core's locked cache.
    pub fn lc_dealloc(&self, ptr: VirtAddr) {
        let mem = self.mem();
        let st = state(self.k, self.id);
        let base = mem.read_u32(st.0.offset(OFF_BASE));

        if ptr.0 < base || ptr.0 >= base + LC_MAX_SIZE {
            return;
        }

        self.lock_mutex(st.mutex());

        let index = (ptr.0 - base) / LC_BLOCK_SIZE;
        let mask = mem.read_u32(st.0.offset(OFF_MASKS + index * 4));
        let bytes = mem.read_u32(st.0.offset(OFF_SIZES + index * 4));

        let alloc_mask = mem.read_u32(st.0.offset(OFF_ALLOC_MASK));
        mem.write_u32(st.0.offset(OFF_ALLOC_MASK), alloc_mask & !mask);
        let free = mem.read_u32(st.0.offset(OFF_FREE_SIZE));
        mem.write_u32(st.0.offset(OFF_FREE_SIZE), free + bytes);

        mem.write_u32(st.0.offset(OFF_MASKS + index * 4), 0);
        mem.write_u32(st.0.offset(OFF_SIZES + index * 4), 0);

        self.unlock_mutex(st.mutex());
    }

    pub fn lc_max_size(&self) -> u32 {
        LC_MAX_SIZE
    }

    /// Largest run of free blocks, in bytes.
    pub fn lc_allocatable_size(&self) -> u32 {
        let mem = self.mem();
        let st = state(self.k, self.id);
        self.lock_mutex(st.mutex());

        let alloc_mask = mem.read_u32(st.0.offset(OFF_ALLOC_MASK));
        let mut largest = 0u32;
        let mut current = 0u32;
        for i in 0..32 {
            if alloc_mask.get_bit(i) {
                largest = largest.max(current);
                current = 0;
            } else {
                current += 1;
            }
        }
        largest = largest.max(current);

        self.unlock_mutex(st.mutex());
        largest * LC_BLOCK_SIZE
    }

    pub fn lc_unallocated(&self) -> u32 {
        let mem = self.mem();
        let st = state(self.k, self.id);
        mem.read_u32(st.0.offset(OFF_FREE_SIZE))
    }

    pub fn lc_is_dma_enabled(&self) -> bool {
        let mem = self.mem();
        let st = state(self.k, self.id);
        mem.read_u32(st.0.offset(OFF_DMA_REFS)) > 0
    }

    /// Enable DMA. Only a thread pinned to this core may enable it.
    pub fn lc_enable_dma(&self) -> bool {
        let mem = self.mem();
        let thread = self.current_thread();
        let affinity = thread.attr(mem) & ThreadAttributes::AFFINITY_ANY.bits();

        if affinity != 1 << self.id {
            return false;
        }

        let st = state(self.k, self.id);
        let refs = mem.read_u32(st.0.offset(OFF_DMA_REFS));
        mem.write_u32(st.0.offset(OFF_DMA_REFS), refs + 1);
        true
    }

    pub fn lc_disable_dma(&self) {
        let mem = self.mem();
        let st = state(self.k, self.id);
        let refs = mem.read_u32(st.0.offset(OFF_DMA_REFS));
        mem.write_u32(st.0.offset(OFF_DMA_REFS), refs - 1);

        if refs - 1 == 0 {
            self.lc_wait_dma_queue(0);
        }
    }

    pub fn lc_dma_queue_length(&self) -> u32 {
        0
    }

    /// DMA load, performed immediately. `blocks` counts 32-byte units;
    /// 0 means 128.
    pub fn lc_load_dma_blocks(&self, dst: VirtAddr, src: VirtAddr, blocks: u32) {
        let blocks = if blocks == 0 { 128 } else { blocks };
        self.mem().copy(dst, src, blocks * 32);
    }

    pub fn lc_store_dma_blocks(&self, dst: VirtAddr, src: VirtAddr, blocks: u32) {
        let blocks = if blocks == 0 { 128 } else { blocks };
        self.mem().copy(dst, src, blocks * 32);
    }

    /// The emulated DMA queue is always drained.
    pub fn lc_wait_dma_queue(&self, _queue_length: u32) {}
}

pub(crate) fn initialise(k: &Kernel, core: u32) {
    let mem = k.mem();
    let st = state(k, core);
    let view = k.core(crate::MAIN_CORE);

    view.init_mutex(st.mutex());
    mem.write_u32(
        st.0.offset(OFF_BASE),
        crate::LOCKED_CACHE_BASE + core * crate::LOCKED_CACHE_STRIDE,
    );
    mem.write_u32(st.0.offset(OFF_FREE_SIZE), LC_MAX_SIZE);
    mem.write_u32(st.0.offset(OFF_ALLOC_MASK), 0);
    for i in 0..32 {
        mem.write_u32(st.0.offset(OFF_MASKS + i * 4), 0);
        mem.write_u32(st.0.offset(OFF_SIZES + i * 4), 0);
    }
    mem.write_u32(st.0.offset(OFF_DMA_REFS), 0);
}
