/*
 * Semaphore
 *
 * Signed counter with a wait queue. Signalling wakes every waiter; the
 * woken threads race on the decrement so exactly `count` of them proceed.
 */

use crate::guest::VirtAddr;
use crate::scheduler;
use crate::thread::ThreadQueue;
use crate::Core;

pub const SEMAPHORE_TAG: u32 = 0x7350_6852; // "sPhR"

guest_struct! {
    pub struct OsSemaphore : 0x20 {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => count, set_count: i32;
        0x10 => queue: struct ThreadQueue;
    }
}

impl<'k> Core<'k> {
    pub fn init_semaphore(&self, semaphore: OsSemaphore, count: i32) {
        self.init_semaphore_ex(semaphore, count, VirtAddr::NULL)
    }

    pub fn init_semaphore_ex(&self, semaphore: OsSemaphore, count: i32, name: VirtAddr) {
        let mem = self.mem();
        semaphore.set_tag(mem, SEMAPHORE_TAG);
        semaphore.set_name(mem, name);
        semaphore.set_count(mem, count);
        crate::thread::init_thread_queue_ex(mem, semaphore.queue(), semaphore.addr());
    }

    /// Decrement, sleeping while the count is not positive. Returns the
    /// count before the decrement.
    pub fn wait_semaphore(&self, semaphore: OsSemaphore) -> i32 {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(semaphore.tag(mem) == SEMAPHORE_TAG);

        while semaphore.count(mem) <= 0 {
            scheduler::sleep_thread_no_lock(self, semaphore.queue().addr());
            scheduler::reschedule_self_no_lock(self);
        }

        let previous = semaphore.count(mem);
        semaphore.set_count(mem, previous - 1);

        scheduler::unlock(k, self.id);
        previous
    }

    /// Decrement without blocking. A result greater than zero means the
    /// decrement happened.
    pub fn try_wait_semaphore(&self, semaphore: OsSemaphore) -> i32 {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(semaphore.tag(mem) == SEMAPHORE_TAG);

        let previous = semaphore.count(mem);
        if previous > 0 {
            semaphore.set_count(mem, previous - 1);
        }

        scheduler::unlock(k, self.id);
        previous
    }

    /// Increment and wake every waiter. Returns the count before the
    /// increment.
    pub fn signal_semaphore(&self, semaphore: OsSemaphore) -> i32 {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(semaphore.tag(mem) == SEMAPHORE_TAG);

        let previous = semaphore.count(mem);
        semaphore.set_count(mem, previous + 1);

        scheduler::wakeup_thread_no_lock(k, semaphore.queue().addr());
        scheduler::reschedule_all_cores_no_lock(self);

        scheduler::unlock(k, self.id);
        previous
    }

    pub fn semaphore_count(&self, semaphore: OsSemaphore) -> i32 {
        let k = self.k;
        scheduler::lock(k, self.id);
        debug_assert!(semaphore.tag(self.mem()) == SEMAPHORE_TAG);
        let count = semaphore.count(self.mem());
        scheduler::unlock(k, self.id);
        count
    }
}
