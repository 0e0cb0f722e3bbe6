/*
 * Fast Mutex
 *
 * Non-recursive mutex with a lock-free fast path: ownership is taken by a
 * single compare-and-swap on the owner word. Contention falls back to the
 * scheduler: the loser records the mutex on the owner's contended list,
 * boosts the owner, and sleeps on the mutex's simple queue.
 */

use crate::guest::list::{self, Link, QueueRef};
use crate::guest::{GuestMemory, VirtAddr};
use crate::scheduler;
use crate::thread::{OsThread, ThreadLink, ThreadSimpleQueue};
use crate::{Core, Kernel};

pub const FAST_MUTEX_TAG: u32 = 0x664D_7458; // "fMtX"

guest_struct! {
    pub struct OsFastMutex : 0x2C {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x08 => owner, set_owner: addr;
        0x0C => queue: struct ThreadSimpleQueue;
        0x14 => link: struct ThreadLink;
        0x1C => contended_link: struct ThreadLink;
    }
}

/// Link of a fast mutex inside its owner's owned list.
pub(crate) const FM_OWNED_LINK: Link = Link { next: 0x14, prev: 0x18 };
/// Link of a fast mutex inside its owner's contended list.
pub(crate) const FM_CONTENDED_LINK: Link = Link { next: 0x1C, prev: 0x20 };

const OWNER_OFFSET: u32 = 0x08;

fn owned(thread: OsThread) -> QueueRef {
    QueueRef(thread.fast_mutex_queue().addr())
}

fn contended(thread: OsThread) -> QueueRef {
    QueueRef(thread.contended_fast_mutexes().addr())
}

/// Order contended mutexes by the priority of their best waiter.
fn contended_is_less(mem: &GuestMemory, lhs: VirtAddr, rhs: VirtAddr) -> bool {
    let lp = head_waiter_priority(mem, OsFastMutex(lhs));
    let rp = head_waiter_priority(mem, OsFastMutex(rhs));
    lp <= rp
}

fn head_waiter_priority(mem: &GuestMemory, fm: OsFastMutex) -> i32 {
    let head = fm.queue().head(mem);
    if head.is_null() {
        i32::MAX
    } else {
        OsThread(head).priority(mem)
    }
}

impl<'k> Core<'k> {
    pub fn init_fast_mutex(&self, fm: OsFastMutex) {
        self.init_fast_mutex_ex(fm, VirtAddr::NULL)
    }

    pub fn init_fast_mutex_ex(&self, fm: OsFastMutex, name: VirtAddr) {
        let mem = self.mem();
        fm.set_tag(mem, FAST_MUTEX_TAG);
        fm.set_name(mem, name);
        fm.set_owner(mem, VirtAddr::NULL);
        fm.queue().set_head(mem, VirtAddr::NULL);
        fm.queue().set_tail(mem, VirtAddr::NULL);
        list::init_link(mem, fm.addr(), FM_OWNED_LINK);
        list::init_link(mem, fm.addr(), FM_CONTENDED_LINK);
    }

    pub fn lock_fast_mutex(&self, fm: OsFastMutex) {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();

        loop {
            // Uncontended: one CAS takes ownership
            if mem.cas_u32(fm.addr().offset(OWNER_OFFSET), 0, thread.addr().0) {
                break;
            }

            scheduler::lock(k, self.id);
            let owner = OsThread(fm.owner(mem));
            if owner.is_null() {
                // Released in the window before we took the lock; retry
                scheduler::unlock(k, self.id);
                continue;
            }

            if owner == thread {
                crate::thread::fatal_thread_error(k, thread, "recursive fast mutex lock");
            }

            thread.set_fast_mutex(mem, fm.addr());
            if !list::contains(mem, contended(owner), fm.addr(), FM_CONTENDED_LINK) {
                list::insert_sorted(
                    mem,
                    contended(owner),
                    fm.addr(),
                    FM_CONTENDED_LINK,
                    contended_is_less,
                );
            }

            scheduler::promote_thread_priority_no_lock(k, owner, thread.priority(mem));
            scheduler::sleep_thread_no_lock(self, fm.queue().addr());
            scheduler::reschedule_self_no_lock(self);
            thread.set_fast_mutex(mem, VirtAddr::NULL);
            scheduler::unlock(k, self.id);
        }

        scheduler::lock(k, self.id);
        list::append(mem, owned(thread), fm.addr(), FM_OWNED_LINK);
        scheduler::unlock(k, self.id);
    }

    pub fn try_lock_fast_mutex(&self, fm: OsFastMutex) -> bool {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();

        if !mem.cas_u32(fm.addr().offset(OWNER_OFFSET), 0, thread.addr().0) {
            return false;
        }

        scheduler::lock(k, self.id);
        list::append(mem, owned(thread), fm.addr(), FM_OWNED_LINK);
        scheduler::unlock(k, self.id);
        true
    }

    pub fn unlock_fast_mutex(&self, fm: OsFastMutex) {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();

        if fm.owner(mem) != thread.addr() {
            crate::thread::fatal_thread_error(k, thread, "unlock of fast mutex we do not own");
        }

        scheduler::lock(k, self.id);
        list::erase(mem, owned(thread), fm.addr(), FM_OWNED_LINK);

        if list::contains(mem, contended(thread), fm.addr(), FM_CONTENDED_LINK) {
            list::erase(mem, contended(thread), fm.addr(), FM_CONTENDED_LINK);
            scheduler::update_thread_priority_no_lock(k, thread);
        }

        mem.store_u32_release(fm.addr().offset(OWNER_OFFSET), 0);

        let head = fm.queue().head(mem);
        if !head.is_null() {
            scheduler::wakeup_one_thread_no_lock(k, OsThread(head));
        }

        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
    }
}

/// Release every fast mutex a dying thread still owns.
pub(crate) fn unlock_all_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    loop {
        let head = thread.fast_mutex_queue().head(mem);
        if head.is_null() {
            break;
        }
        let fm = OsFastMutex(head);
        list::erase(mem, owned(thread), fm.addr(), FM_OWNED_LINK);
        if list::contains(mem, contended(thread), fm.addr(), FM_CONTENDED_LINK) {
            list::erase(mem, contended(thread), fm.addr(), FM_CONTENDED_LINK);
        }
        mem.store_u32_release(fm.addr().offset(OWNER_OFFSET), 0);
        scheduler::wakeup_thread_no_lock(k, fm.queue().addr());
    }
}
