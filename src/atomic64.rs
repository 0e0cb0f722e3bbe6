/*
 * 64-bit Atomics
 *
 * The guest ABI offers atomic 64-bit operations; we match the console's
 * behaviour of funnelling them all through one shared id-lock rather than
 * relying on host 64-bit atomics.
 */

use bit_field::BitField;

use crate::guest::VirtAddr;
use crate::idlock;
use crate::Core;

macro_rules! locked {
    ($core:expr, $body:expr) => {{
        let id = idlock::core_lock_id($core.id);
        $core.k.atomic64_lock.acquire(id);
        let result = $body;
        $core.k.atomic64_lock.release(id);
        result
    }};
}

impl<'k> Core<'k> {
    pub fn get_atomic64(&self, ptr: VirtAddr) -> u64 {
        locked!(self, self.mem().read_u64(ptr))
    }

    pub fn set_atomic64(&self, ptr: VirtAddr, value: u64) -> u64 {
        locked!(self, {
            let old = self.mem().read_u64(ptr);
            self.mem().write_u64(ptr, value);
            old
        })
    }

    pub fn swap_atomic64(&self, ptr: VirtAddr, value: u64) -> u64 {
        self.set_atomic64(ptr, value)
    }

    pub fn compare_and_swap_atomic64(&self, ptr: VirtAddr, compare: u64, value: u64) -> bool {
        locked!(self, {
            if self.mem().read_u64(ptr) == compare {
                self.mem().write_u64(ptr, value);
                true
            } else {
                false
            }
        })
    }

    /// Compare-and-swap that also reports the old value.
    pub fn compare_and_swap_atomic64_ex(
        &self,
        ptr: VirtAddr,
        compare: u64,
        value: u64,
    ) -> (bool, u64) {
        locked!(self, {
            let old = self.mem().read_u64(ptr);
            if old == compare {
                self.mem().write_u64(ptr, value);
                (true, old)
            } else {
                (false, old)
            }
        })
    }

    pub fn add_atomic64(&self, ptr: VirtAddr, value: i64) -> i64 {
        locked!(self, {
            let result = self.mem().read_i64(ptr).wrapping_add(value);
            self.mem().write_i64(ptr, result);
            result
        })
    }

    pub fn and_atomic64(&self, ptr: VirtAddr, value: u64) -> u64 {
        locked!(self, {
            let result = self.mem().read_u64(ptr) & value;
            self.mem().write_u64(ptr, result);
            result
        })
    }

    pub fn or_atomic64(&self, ptr: VirtAddr, value: u64) -> u64 {
        locked!(self, {
            let result = self.mem().read_u64(ptr) | value;
            self.mem().write_u64(ptr, result);
            result
        })
    }

    pub fn xor_atomic64(&self, ptr: VirtAddr, value: u64) -> u64 {
        locked!(self, {
            let result = self.mem().read_u64(ptr) ^ value;
            self.mem().write_u64(ptr, result);
            result
        })
    }

    pub fn test_and_clear_atomic64(&self, ptr: VirtAddr, bit: u32) -> bool {
        locked!(self, {
            let mut value = self.mem().read_u64(ptr);
            let was_set = value.get_bit(bit as usize);
            value.set_bit(bit as usize, false);
            self.mem().write_u64(ptr, value);
            was_set
        })
    }

    pub fn test_and_set_atomic64(&self, ptr: VirtAddr, bit: u32) -> bool {
        locked!(self, {
            let mut value = self.mem().read_u64(ptr);
            let was_set = value.get_bit(bit as usize);
            value.set_bit(bit as usize, true);
            self.mem().write_u64(ptr, value);
            was_set
        })
    }
}
