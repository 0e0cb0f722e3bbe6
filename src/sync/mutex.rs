/*
 * Mutex and Condition Variable
 *
 * The mutex is recursive and priority-inheriting: a blocked locker boosts
 * the owner (and any chain of owners the owner itself is blocked behind).
 * Only the owner may unlock. Waking is wake-all; woken threads race to
 * take ownership in priority order.
 */

use crate::guest::list::{self, Link, QueueRef};
use crate::guest::VirtAddr;
use crate::scheduler;
use crate::thread::{CancelState, OsThread, ThreadLink, ThreadQueue, ThreadState};
use crate::{Core, Kernel};

pub const MUTEX_TAG: u32 = 0x6D55_7458; // "mUtX"
pub const COND_TAG: u32 = 0x634E_6456; // "cNdV"

guest_struct! {
    pub struct OsMutex : 0x44 {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => queue: struct ThreadQueue;
        0x1C => owner, set_owner: addr;
        0x20 => count, set_count: i32;
        0x24 => link: struct ThreadLink;
    }
}

guest_struct! {
    pub struct OsCondition : 0x20 {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => queue: struct ThreadQueue;
    }
}

/// Link of a mutex inside its owner's owned-mutex queue.
pub(crate) const MUTEX_LINK: Link = Link { next: 0x24, prev: 0x28 };

impl<'k> Core<'k> {
    pub fn init_mutex(&self, mutex: OsMutex) {
        self.init_mutex_ex(mutex, VirtAddr::NULL)
    }

    pub fn init_mutex_ex(&self, mutex: OsMutex, name: VirtAddr) {
        let mem = self.mem();
        mutex.set_tag(mem, MUTEX_TAG);
        mutex.set_name(mem, name);
        mutex.set_owner(mem, VirtAddr::NULL);
        mutex.set_count(mem, 0);
        crate::thread::init_thread_queue_ex(mem, mutex.queue(), mutex.addr());
        list::init_link(mem, mutex.addr(), MUTEX_LINK);
    }

    /// Lock the mutex, sleeping while another thread owns it. Relocking
    /// from the owner increases the recursion count.
    pub fn lock_mutex(&self, mutex: OsMutex) {
        let k = self.k;
        scheduler::lock(k, self.id);

        // Some games lock mutexes they never initialised
        if mutex.tag(self.mem()) != MUTEX_TAG {
            self.init_mutex(mutex);
        }

        scheduler::test_thread_cancel_no_lock(self);
        lock_mutex_no_lock(self, mutex);
        scheduler::unlock(k, self.id);
    }

    /// Lock the mutex without blocking; false if another thread owns it.
    pub fn try_lock_mutex(&self, mutex: OsMutex) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        let thread = self.current_thread();
        debug_assert!(thread.state(mem) == ThreadState::Running);

        scheduler::test_thread_cancel_no_lock(self);

        let owner = mutex.owner(mem);
        if owner == thread.addr() {
            mutex.set_count(mem, mutex.count(mem) + 1);
            scheduler::unlock(k, self.id);
            return true;
        } else if !owner.is_null() {
            scheduler::unlock(k, self.id);
            return false;
        }

        mutex.set_count(mem, mutex.count(mem) + 1);
        mutex.set_owner(mem, thread.addr());
        list::append(mem, owned_mutexes(thread), mutex.addr(), MUTEX_LINK);
        thread.set_cancel_state(
            mem,
            thread.cancel_state(mem) | CancelState::DISABLED_BY_MUTEX.bits(),
        );

        scheduler::unlock(k, self.id);
        true
    }

    /// Unlock the mutex. Decrements the recursion count; the mutex is
    /// released and all waiters woken when it reaches zero.
    pub fn unlock_mutex(&self, mutex: OsMutex) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        let thread = self.current_thread();
        if mutex.tag(mem) != MUTEX_TAG {
            crate::thread::fatal_thread_error(k, thread, "unlock of uninitialised mutex");
        }
        if mutex.owner(mem) != thread.addr() {
            crate::thread::fatal_thread_error(k, thread, "unlock of mutex we do not own");
        }

        mutex.set_count(mem, mutex.count(mem) - 1);
        if mutex.count(mem) > 0 {
            scheduler::unlock(k, self.id);
            return;
        }

        list::erase(mem, owned_mutexes(thread), mutex.addr(), MUTEX_LINK);
        mutex.set_owner(mem, VirtAddr::NULL);

        // Drop any priority boost we gained from waiters
        if thread.priority(mem) < thread.base_priority(mem) {
            let p = scheduler::calculate_thread_priority_no_lock(k, thread);
            thread.set_priority(mem, p);
        }

        if thread.mutex_queue().head(mem).is_null() {
            thread.set_cancel_state(
                mem,
                thread.cancel_state(mem) & !CancelState::DISABLED_BY_MUTEX.bits(),
            );
        }

        scheduler::wakeup_thread_no_lock(k, mutex.queue().addr());
        scheduler::test_thread_cancel_no_lock(self);
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
    }

    pub fn init_cond(&self, condition: OsCondition) {
        self.init_cond_ex(condition, VirtAddr::NULL)
    }

    pub fn init_cond_ex(&self, condition: OsCondition, name: VirtAddr) {
        let mem = self.mem();
        condition.set_tag(mem, COND_TAG);
        condition.set_name(mem, name);
        crate::thread::init_thread_queue_ex(mem, condition.queue(), condition.addr());
    }

    /// Atomically release `mutex`, sleep on `condition`, then reacquire
    /// `mutex` with its former recursion count.
    pub fn wait_cond(&self, condition: OsCondition, mutex: OsMutex) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        let thread = self.current_thread();
        debug_assert!(condition.tag(mem) == COND_TAG);
        debug_assert!(mutex.tag(mem) == MUTEX_TAG);
        debug_assert!(thread.state(mem) == ThreadState::Running);
        if mutex.owner(mem) != thread.addr() {
            crate::thread::fatal_thread_error(k, thread, "wait_cond without owning the mutex");
        }

        // Fully release the mutex, remembering the recursion depth
        let saved_count = mutex.count(mem);
        mutex.set_count(mem, 0);
        mutex.set_owner(mem, VirtAddr::NULL);
        list::erase(mem, owned_mutexes(thread), mutex.addr(), MUTEX_LINK);

        if thread.priority(mem) < thread.base_priority(mem) {
            let p = scheduler::calculate_thread_priority_no_lock(k, thread);
            thread.set_priority(mem, p);
        }

        // Hand the mutex over without letting this core switch away yet
        scheduler::disable(k, self.id);
        scheduler::wakeup_thread_no_lock(k, mutex.queue().addr());
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::enable(k, self.id);

        scheduler::sleep_thread_no_lock(self, condition.queue().addr());
        scheduler::reschedule_self_no_lock(self);

        lock_mutex_no_lock(self, mutex);
        mutex.set_count(mem, saved_count);

        scheduler::unlock(k, self.id);
    }

    /// Wake every thread waiting on the condition.
    pub fn signal_cond(&self, condition: OsCondition) {
        debug_assert!(condition.tag(self.mem()) == COND_TAG);
        self.wakeup_thread(condition.queue());
    }
}

fn owned_mutexes(thread: OsThread) -> QueueRef {
    QueueRef(thread.mutex_queue().addr())
}

pub(crate) fn lock_mutex_no_lock(core: &Core<'_>, mutex: OsMutex) {
    let k = core.k;
    let mem = core.mem();
    let thread = core.current_thread();
    debug_assert!(thread.state(mem) == ThreadState::Running);

    loop {
        let owner = mutex.owner(mem);
        if owner.is_null() {
            break;
        }

        if owner == thread.addr() {
            mutex.set_count(mem, mutex.count(mem) + 1);
            return;
        }

        // Boost the owner past us, then wait for the unlock
        thread.set_mutex(mem, mutex.addr());
        scheduler::promote_thread_priority_no_lock(k, OsThread(owner), thread.priority(mem));
        scheduler::sleep_thread_no_lock(core, mutex.queue().addr());
        scheduler::reschedule_self_no_lock(core);
        thread.set_mutex(mem, VirtAddr::NULL);
    }

    mutex.set_count(mem, mutex.count(mem) + 1);
    mutex.set_owner(mem, thread.addr());
    list::append(mem, owned_mutexes(thread), mutex.addr(), MUTEX_LINK);
    thread.set_cancel_state(
        mem,
        thread.cancel_state(mem) | CancelState::DISABLED_BY_MUTEX.bits(),
    );
}

/// Release every mutex a dying thread still owns.
pub(crate) fn unlock_all_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    loop {
        let head = thread.mutex_queue().head(mem);
        if head.is_null() {
            break;
        }
        let mutex = OsMutex(head);
        list::erase(mem, owned_mutexes(thread), mutex.addr(), MUTEX_LINK);
        mutex.set_count(mem, 0);
        mutex.set_owner(mem, VirtAddr::NULL);
        scheduler::wakeup_thread_no_lock(k, mutex.queue().addr());
    }
}
