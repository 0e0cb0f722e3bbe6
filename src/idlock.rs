/*
 * Id Lock
 *
 * A spin lock whose owner word identifies the holder: a per-core bit for
 * core-scoped acquisition, a guest address for per-object acquisition, or
 * the high bit when acquired from outside any core. The scheduler lock,
 * the alarm lock and the 64-bit atomic emulation all use this.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::guest::VirtAddr;

/// Lock id used when the caller is not running on an emulated core.
pub const NON_CPU_CORE_ID: u32 = 1 << 31;

pub struct IdLock {
    owner: AtomicU32,
}

impl IdLock {
    pub const fn new() -> IdLock {
        IdLock { owner: AtomicU32::new(0) }
    }

    pub fn acquire(&self, id: u32) -> bool {
        if id == 0 {
            return false;
        }

        loop {
            match self
                .owner
                .compare_exchange_weak(0, id, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    /// Release unconditionally; reports whether `id` was actually the holder.
    pub fn release(&self, id: u32) -> bool {
        self.owner.swap(0, Ordering::Release) == id
    }

    pub fn is_held_by(&self, id: u32) -> bool {
        self.owner.load(Ordering::Acquire) == id
    }

    pub fn is_held_by_someone(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }
}

/// Lock id for a core.
#[inline]
pub fn core_lock_id(core: u32) -> u32 {
    if core < crate::cpu::CORE_COUNT {
        1 << core
    } else {
        NON_CPU_CORE_ID
    }
}

/// Lock id for a guest object.
#[inline]
pub fn object_lock_id(addr: VirtAddr) -> u32 {
    debug_assert!(!addr.is_null());
    addr.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::VirtAddr;

    #[test]
    fn acquire_release_by_core_id() {
        let lock = IdLock::new();
        assert!(lock.acquire(core_lock_id(1)));
        assert!(lock.is_held_by(core_lock_id(1)));
        assert!(!lock.is_held_by(core_lock_id(0)));
        assert!(lock.release(core_lock_id(1)));
        assert!(!lock.is_held_by_someone());
    }

    #[test]
    fn zero_id_is_rejected() {
        let lock = IdLock::new();
        assert!(!lock.acquire(0));
        assert!(!lock.is_held_by_someone());
    }

    #[test]
    fn release_reports_foreign_owner() {
        let lock = IdLock::new();
        lock.acquire(object_lock_id(VirtAddr(0x1000)));
        // Wrong id still unlocks, but reports the mismatch
        assert!(!lock.release(core_lock_id(2)));
        assert!(!lock.is_held_by_someone());
    }
}
