/*
 * Spin Lock
 *
 * Recursive spin lock over a guest owner word. Holding any spin lock
 * forces the holder's effective priority to 0 via the context's
 * spin-lock count. The uninterruptible variants additionally disable
 * interrupts for the duration of the hold.
 */

use crate::guest::VirtAddr;
use crate::scheduler;
use crate::thread::{CancelState, OsThread};
use crate::time;
use crate::Core;

guest_struct! {
    pub struct OsSpinLock : 0x10 {
        0x00 => owner, set_owner: addr;
        0x08 => recursion, set_recursion: u32;
        0x0C => restore_interrupt_state, set_restore_interrupt_state: u32;
    }
}

const OWNER_OFFSET: u32 = 0x00;

fn increase_spin_lock_count(core: &Core<'_>, thread: OsThread) {
    let k = core.k;
    let mem = core.mem();
    scheduler::lock(k, core.id);
    let ctx = thread.context();
    ctx.set_spin_lock_count(mem, ctx.spin_lock_count(mem) + 1);
    thread.set_priority(mem, 0);
    scheduler::unlock(k, core.id);
}

fn decrease_spin_lock_count(core: &Core<'_>, thread: OsThread) {
    let k = core.k;
    let mem = core.mem();
    scheduler::lock(k, core.id);
    let ctx = thread.context();
    ctx.set_spin_lock_count(mem, ctx.spin_lock_count(mem) - 1);
    let p = scheduler::calculate_thread_priority_no_lock(k, thread);
    thread.set_priority(mem, p);
    scheduler::unlock(k, core.id);
}

/// Returns true if ownership was newly taken (not a recursion).
fn spin_acquire(core: &Core<'_>, lock: OsSpinLock) -> bool {
    let mem = core.mem();
    let thread = core.current_thread();

    if lock.owner(mem) == thread.addr() {
        lock.set_recursion(mem, lock.recursion(mem) + 1);
        return false;
    }

    while !mem.cas_u32(lock.addr().offset(OWNER_OFFSET), 0, thread.addr().0) {
        core::hint::spin_loop();
    }

    increase_spin_lock_count(core, thread);
    true
}

fn spin_try(core: &Core<'_>, lock: OsSpinLock) -> bool {
    let mem = core.mem();
    let thread = core.current_thread();

    if lock.owner(mem) == thread.addr() {
        lock.set_recursion(mem, lock.recursion(mem) + 1);
        return true;
    }

    if mem.cas_u32(lock.addr().offset(OWNER_OFFSET), 0, thread.addr().0) {
        increase_spin_lock_count(core, thread);
        true
    } else {
        false
    }
}

fn spin_try_with_timeout(core: &Core<'_>, lock: OsSpinLock, duration_ticks: i64) -> bool {
    let mem = core.mem();
    let thread = core.current_thread();

    if lock.owner(mem) == thread.addr() {
        lock.set_recursion(mem, lock.recursion(mem) + 1);
        return true;
    }

    let timeout = core.k.system_time() + duration_ticks;
    while !mem.cas_u32(lock.addr().offset(OWNER_OFFSET), 0, thread.addr().0) {
        if core.k.system_time() >= timeout {
            return false;
        }
        core::hint::spin_loop();
    }

    increase_spin_lock_count(core, thread);
    true
}

/// Returns true if the lock was actually released (not a recursion pop).
fn spin_release(core: &Core<'_>, lock: OsSpinLock) -> bool {
    let mem = core.mem();
    let thread = core.current_thread();

    if lock.recursion(mem) > 0 {
        lock.set_recursion(mem, lock.recursion(mem) - 1);
        return false;
    }

    if lock.owner(mem) == thread.addr() {
        mem.store_u32_release(lock.addr().offset(OWNER_OFFSET), 0);
        decrease_spin_lock_count(core, thread);
        return true;
    }

    crate::thread::fatal_thread_error(core.k, thread, "release of spin lock we do not own");
}

impl<'k> Core<'k> {
    pub fn init_spin_lock(&self, lock: OsSpinLock) {
        let mem = self.mem();
        lock.set_owner(mem, VirtAddr::NULL);
        lock.set_recursion(mem, 0);
    }

    pub fn acquire_spin_lock(&self, lock: OsSpinLock) -> bool {
        self.test_thread_cancel();
        spin_acquire(self, lock);
        true
    }

    pub fn try_acquire_spin_lock(&self, lock: OsSpinLock) -> bool {
        self.test_thread_cancel();
        spin_try(self, lock)
    }

    pub fn try_acquire_spin_lock_with_timeout(&self, lock: OsSpinLock, timeout_ns: i64) -> bool {
        self.test_thread_cancel();
        spin_try_with_timeout(self, lock, time::ns_to_ticks(timeout_ns))
    }

    pub fn release_spin_lock(&self, lock: OsSpinLock) -> bool {
        spin_release(self, lock);
        self.test_thread_cancel();
        true
    }

    /// Acquire with interrupts disabled for the duration of the hold.
    pub fn uninterruptible_spin_lock_acquire(&self, lock: OsSpinLock) -> bool {
        if spin_acquire(self, lock) {
            let state = self.disable_interrupts();
            lock.set_restore_interrupt_state(self.mem(), state as u32);
        }

        let thread = self.current_thread();
        if !thread.is_null() {
            let mem = self.mem();
            thread.set_cancel_state(
                mem,
                thread.cancel_state(mem) | CancelState::DISABLED_BY_SPINLOCK.bits(),
            );
        }

        true
    }

    pub fn uninterruptible_spin_lock_try_acquire(&self, lock: OsSpinLock) -> bool {
        if !spin_try(self, lock) {
            return false;
        }

        let state = self.disable_interrupts();
        lock.set_restore_interrupt_state(self.mem(), state as u32);

        let thread = self.current_thread();
        if !thread.is_null() {
            let mem = self.mem();
            thread.set_cancel_state(
                mem,
                thread.cancel_state(mem) | CancelState::DISABLED_BY_SPINLOCK.bits(),
            );
        }

        true
    }

    pub fn uninterruptible_spin_lock_try_acquire_with_timeout(
        &self,
        lock: OsSpinLock,
        timeout_ns: i64,
    ) -> bool {
        if !spin_try_with_timeout(self, lock, time::ns_to_ticks(timeout_ns)) {
            return false;
        }

        let state = self.disable_interrupts();
        lock.set_restore_interrupt_state(self.mem(), state as u32);

        let thread = self.current_thread();
        if !thread.is_null() {
            let mem = self.mem();
            thread.set_cancel_state(
                mem,
                thread.cancel_state(mem) | CancelState::DISABLED_BY_SPINLOCK.bits(),
            );
        }

        true
    }

    pub fn uninterruptible_spin_lock_release(&self, lock: OsSpinLock) -> bool {
        if spin_release(self, lock) {
            self.restore_interrupts(lock.restore_interrupt_state(self.mem()) != 0);
        }

        let thread = self.current_thread();
        if !thread.is_null() {
            let mem = self.mem();
            thread.set_cancel_state(
                mem,
                thread.cancel_state(mem) & !CancelState::DISABLED_BY_SPINLOCK.bits(),
            );
        }

        true
    }
}
