use super::event::EventMode;
use super::msgqueue::{MessageFlags, OsMessage, OsMessageQueue};
use super::*;
use crate::alarm::AlarmState;
use crate::guest::list;
use crate::guest::VirtAddr;
use crate::scheduler;
use crate::testkit::TestKernel;
use crate::thread::{CancelState, ThreadState};

fn alloc_mutex(t: &TestKernel) -> OsMutex {
    OsMutex(t.alloc(OsMutex::SIZE, 4))
}

#[test]
fn mutex_recursion_to_depth_ten() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();
    let thread = core.current_thread();

    let m = alloc_mutex(&t);
    core.init_mutex(m);

    for n in 1..=10 {
        core.lock_mutex(m);
        assert_eq!(m.count(mem), n);
    }
    assert_eq!(m.owner(mem), thread.addr());
    assert_ne!(thread.cancel_state(mem) & CancelState::DISABLED_BY_MUTEX.bits(), 0);

    for n in (0..10).rev() {
        core.unlock_mutex(m);
        assert_eq!(m.count(mem), n);
    }
    assert!(m.owner(mem).is_null());
    assert_eq!(thread.cancel_state(mem) & CancelState::DISABLED_BY_MUTEX.bits(), 0);
}

#[test]
fn try_lock_respects_foreign_ownership() {
    let t = TestKernel::new();
    let core1 = t.k.core(1);
    let core0 = t.k.core(0);
    let mem = t.k.mem();

    let m = alloc_mutex(&t);
    core1.init_mutex(m);

    let b = t.spawn_thread(&core1, 20, 0b001);
    core0.handle_reschedule_interrupt();
    assert_eq!(core0.current_thread(), b);

    // Lock three times on core 1, unlock twice: still foreign-owned
    core1.lock_mutex(m);
    core1.lock_mutex(m);
    core1.lock_mutex(m);
    core1.unlock_mutex(m);
    core1.unlock_mutex(m);
    assert!(!core0.try_lock_mutex(m));

    core1.unlock_mutex(m);
    assert!(core0.try_lock_mutex(m));
    assert_eq!(m.owner(mem), b.addr());
}

#[test]
fn lock_initialises_an_uninitialised_mutex() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let m = alloc_mutex(&t);
    // Never initialised: the tag is garbage (zero)
    assert_ne!(m.tag(mem), super::mutex::MUTEX_TAG);
    core.lock_mutex(m);
    assert_eq!(m.tag(mem), super::mutex::MUTEX_TAG);
    assert_eq!(m.count(mem), 1);
    core.unlock_mutex(m);
}

#[test]
fn contended_lock_boosts_and_unlock_restores() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let k = &t.k;
    let mem = t.k.mem();

    let l = t.spawn_thread(&core, 20, 0b010);
    let h = t.spawn_thread(&core, 5, 0b010);

    let m = alloc_mutex(&t);
    core.init_mutex(m);

    t.make_current(1, l);
    core.lock_mutex(m);
    assert_eq!(m.owner(mem), l.addr());

    // h blocks on the mutex: it boosts the owner and goes to sleep
    t.make_current(1, h);
    scheduler::lock(k, 1);
    h.set_mutex(mem, m.addr());
    scheduler::promote_thread_priority_no_lock(k, l, h.priority(mem));
    scheduler::sleep_thread_no_lock(&core, m.queue().addr());
    scheduler::unlock(k, 1);

    assert_eq!(l.priority(mem), 5);
    assert_eq!(l.base_priority(mem), 20);
    assert_eq!(t.queue_members(m.queue().addr()), vec![h]);

    // The owner releases: its boost is dropped and the waiter wakes
    t.make_current(1, l);
    core.unlock_mutex(m);
    assert_eq!(l.priority(mem), 20);
    assert!(m.owner(mem).is_null());
    // The woken waiter outranks the old owner and takes the core
    assert_ne!(h.state(mem), ThreadState::Waiting);
    assert_eq!(core.current_thread(), h);

    // ... and completes its acquisition
    h.set_mutex(mem, VirtAddr::NULL);
    assert!(core.try_lock_mutex(m));
    assert_eq!(m.owner(mem), h.addr());
}

#[test]
fn priority_boost_walks_the_owner_chain() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let k = &t.k;
    let mem = t.k.mem();

    let c = t.spawn_thread(&core, 25, 0b010);
    let b = t.spawn_thread(&core, 15, 0b010);
    let a = t.spawn_thread(&core, 5, 0b010);

    let m1 = alloc_mutex(&t);
    let m2 = alloc_mutex(&t);
    core.init_mutex(m1);
    core.init_mutex(m2);

    // c owns m1; b owns m2 and blocks on m1
    t.make_current(1, c);
    core.lock_mutex(m1);
    t.make_current(1, b);
    core.lock_mutex(m2);

    scheduler::lock(k, 1);
    b.set_mutex(mem, m1.addr());
    scheduler::promote_thread_priority_no_lock(k, c, b.priority(mem));
    scheduler::sleep_thread_no_lock(&core, m1.queue().addr());
    scheduler::unlock(k, 1);
    assert_eq!(c.priority(mem), 15);

    // a blocks on m2: the boost propagates through b to c
    t.make_current(1, a);
    scheduler::lock(k, 1);
    a.set_mutex(mem, m2.addr());
    scheduler::promote_thread_priority_no_lock(
        k,
        crate::thread::OsThread(m2.owner(mem)),
        a.priority(mem),
    );
    scheduler::sleep_thread_no_lock(&core, m2.queue().addr());
    scheduler::unlock(k, 1);

    assert_eq!(b.priority(mem), 5);
    assert_eq!(c.priority(mem), 5);
}

#[test]
fn condition_wait_releases_and_reacquires() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let a = t.spawn_thread(&core, 20, 0b010);
    let m = alloc_mutex(&t);
    let cv = OsCondition(t.alloc(OsCondition::SIZE, 4));
    core.init_mutex(m);
    core.init_cond(cv);

    t.make_current(1, a);
    core.lock_mutex(m);
    core.lock_mutex(m);
    core.lock_mutex(m);
    assert_eq!(m.count(mem), 3);

    core.wait_cond(cv, m);
    // The sleeper sits on the condition queue; on wake it reacquired the
    // mutex with its old recursion depth
    assert_eq!(t.queue_members(cv.queue().addr()), vec![a]);
    assert_eq!(m.owner(mem), a.addr());
    assert_eq!(m.count(mem), 3);

    core.signal_cond(cv);
    assert!(t.queue_members(cv.queue().addr()).is_empty());
    assert_eq!(a.state(mem), ThreadState::Ready);
}

#[test]
fn exit_releases_owned_mutexes() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let a = t.spawn_thread(&core, 20, 0b010);
    let m1 = alloc_mutex(&t);
    let m2 = alloc_mutex(&t);
    core.init_mutex(m1);
    core.init_mutex(m2);

    t.make_current(1, a);
    core.lock_mutex(m1);
    core.lock_mutex(m2);
    core.lock_mutex(m2);

    core.exit_thread(0);
    assert!(m1.owner(mem).is_null());
    assert!(m2.owner(mem).is_null());
    assert_eq!(m1.count(mem), 0);
    assert_eq!(m2.count(mem), 0);
    assert!(a.mutex_queue().head(mem).is_null());
}

#[test]
#[should_panic(expected = "mutex we do not own")]
fn unlock_of_foreign_mutex_is_fatal() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let l = t.spawn_thread(&core, 20, 0b010);
    let m = alloc_mutex(&t);
    core.init_mutex(m);
    t.make_current(1, l);
    core.lock_mutex(m);

    t.make_current(1, t.default_thread(1));
    core.unlock_mutex(m);
}

#[test]
fn fast_mutex_fast_path_and_owned_list() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();
    let thread = core.current_thread();

    let fm = OsFastMutex(t.alloc(OsFastMutex::SIZE, 4));
    core.init_fast_mutex(fm);

    core.lock_fast_mutex(fm);
    assert_eq!(fm.owner(mem), thread.addr());
    assert_eq!(thread.fast_mutex_queue().head(mem), fm.addr());

    core.unlock_fast_mutex(fm);
    assert!(fm.owner(mem).is_null());
    assert!(thread.fast_mutex_queue().head(mem).is_null());
}

#[test]
fn fast_mutex_try_lock_fails_when_held() {
    let t = TestKernel::new();
    let core1 = t.k.core(1);
    let core0 = t.k.core(0);

    let fm = OsFastMutex(t.alloc(OsFastMutex::SIZE, 4));
    core1.init_fast_mutex(fm);

    let b = t.spawn_thread(&core1, 20, 0b001);
    core0.handle_reschedule_interrupt();
    assert_eq!(core0.current_thread(), b);

    core1.lock_fast_mutex(fm);
    assert!(!core0.try_lock_fast_mutex(fm));
    core1.unlock_fast_mutex(fm);
    assert!(core0.try_lock_fast_mutex(fm));
}

#[test]
fn fast_mutex_contention_boosts_and_release_wakes_head() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let k = &t.k;
    let mem = t.k.mem();

    let l = t.spawn_thread(&core, 20, 0b010);
    let h = t.spawn_thread(&core, 5, 0b010);
    let fm = OsFastMutex(t.alloc(OsFastMutex::SIZE, 4));
    core.init_fast_mutex(fm);

    t.make_current(1, l);
    core.lock_fast_mutex(fm);

    // h loses the race and blocks
    t.make_current(1, h);
    scheduler::lock(k, 1);
    h.set_fast_mutex(mem, fm.addr());
    list::insert_sorted(
        mem,
        list::QueueRef(l.contended_fast_mutexes().addr()),
        fm.addr(),
        super::fastmutex::FM_CONTENDED_LINK,
        |_, _, _| true,
    );
    scheduler::promote_thread_priority_no_lock(k, l, h.priority(mem));
    scheduler::sleep_thread_no_lock(&core, fm.queue().addr());
    scheduler::unlock(k, 1);

    assert_eq!(l.priority(mem), 5);
    assert_eq!(t.queue_members(fm.queue().addr()), vec![h]);

    t.make_current(1, l);
    core.unlock_fast_mutex(fm);
    assert_eq!(l.priority(mem), 20);
    assert!(fm.owner(mem).is_null());
    assert_ne!(h.state(mem), ThreadState::Waiting);
    assert!(l.contended_fast_mutexes().head(mem).is_null());
}

#[test]
fn semaphore_counts_without_blocking() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let s = OsSemaphore(t.alloc(OsSemaphore::SIZE, 4));
    core.init_semaphore(s, 2);

    assert_eq!(core.wait_semaphore(s), 2);
    assert_eq!(core.wait_semaphore(s), 1);
    assert_eq!(core.semaphore_count(s), 0);

    // Non-blocking wait fails without touching the count
    assert_eq!(core.try_wait_semaphore(s), 0);
    assert_eq!(core.semaphore_count(s), 0);

    assert_eq!(core.signal_semaphore(s), 0);
    assert_eq!(core.semaphore_count(s), 1);
}

#[test]
fn semaphore_signal_wakes_every_waiter() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let k = &t.k;
    let mem = t.k.mem();

    let s = OsSemaphore(t.alloc(OsSemaphore::SIZE, 4));
    core.init_semaphore(s, 0);

    let h = t.spawn_thread(&core, 5, 0b010);
    let l = t.spawn_thread(&core, 20, 0b010);

    for w in [h, l] {
        t.make_current(1, w);
        scheduler::lock(k, 1);
        scheduler::sleep_thread_no_lock(&core, s.queue().addr());
        scheduler::unlock(k, 1);
    }
    assert_eq!(t.queue_members(s.queue().addr()), vec![h, l]);

    t.make_current(1, t.default_thread(1));
    core.signal_semaphore(s);

    // All waiters wake and race; the count covers exactly one of them
    assert_ne!(h.state(mem), ThreadState::Waiting);
    assert_eq!(core.current_thread(), h);
    assert_eq!(l.state(mem), ThreadState::Ready);
    assert_eq!(s.count(mem), 1);
    assert_eq!(core.try_wait_semaphore(s), 1);
    assert_eq!(core.try_wait_semaphore(s), 0);
}

#[test]
fn auto_reset_event_hands_the_signal_to_one_waiter() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let e = OsEvent(t.alloc(OsEvent::SIZE, 4));
    core.init_event(e, false, EventMode::AutoReset);

    let w = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, w);
    core.wait_event(e);
    assert_eq!(w.state(mem), ThreadState::Waiting);
    assert_eq!(t.queue_members(e.queue().addr()), vec![w]);

    t.make_current(1, t.default_thread(1));
    core.signal_event(e);
    // Woken waiter consumed the signal: the value stays clear
    assert_eq!(e.value(mem), 0);
    assert_ne!(w.state(mem), ThreadState::Waiting);
    assert_eq!(core.current_thread(), w);
}

#[test]
fn manual_reset_event_wakes_everyone_and_latches() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let e = OsEvent(t.alloc(OsEvent::SIZE, 4));
    core.init_event(e, false, EventMode::ManualReset);

    let w1 = t.spawn_thread(&core, 10, 0b010);
    let w2 = t.spawn_thread(&core, 20, 0b010);
    for w in [w1, w2] {
        t.make_current(1, w);
        core.wait_event(e);
    }

    t.make_current(1, t.default_thread(1));
    core.signal_event(e);
    assert_eq!(e.value(mem), 1);
    assert_ne!(w1.state(mem), ThreadState::Waiting);
    assert_ne!(w2.state(mem), ThreadState::Waiting);

    // Latched: a new wait passes straight through
    core.wait_event(e);
    assert_eq!(e.value(mem), 1);

    core.reset_event(e);
    assert_eq!(e.value(mem), 0);
}

#[test]
fn auto_reset_wait_consumes_a_pending_signal() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let e = OsEvent(t.alloc(OsEvent::SIZE, 4));
    core.init_event(e, true, EventMode::AutoReset);

    core.wait_event(e);
    assert_eq!(e.value(mem), 0);
    // No sleep happened
    assert_eq!(core.current_thread(), t.default_thread(1));
}

#[test]
fn signal_all_on_auto_reset_only_latches_when_nobody_wakes() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let e = OsEvent(t.alloc(OsEvent::SIZE, 4));
    core.init_event(e, false, EventMode::AutoReset);

    // Empty queue: nothing happens, nothing latches
    core.signal_event_all(e);
    assert_eq!(e.value(mem), 0);

    let w = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, w);
    core.wait_event(e);
    t.make_current(1, t.default_thread(1));

    core.signal_event_all(e);
    assert_ne!(w.state(mem), ThreadState::Waiting);
    assert_eq!(e.value(mem), 0);
}

#[test]
fn event_timeout_alarm_fires_and_wakes_the_waiter() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let k = &t.k;
    let mem = t.k.mem();

    let e = OsEvent(t.alloc(OsEvent::SIZE, 4));
    core.init_event(e, false, EventMode::ManualReset);
    let w = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, w);

    core.wait_event_with_timeout(e, 50_000_000);
    assert_eq!(w.state(mem), ThreadState::Waiting);
    // Per the contract, the timeout alarm pointer is clear after return
    assert!(w.wait_event_timeout_alarm(mem).is_null());

    // The one-shot system alarm is armed on this core
    let armed = t.queue_members_alarm(k.statics.alarm[1].alarm_queue);
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].group(mem), crate::alarm::SYSTEM_ALARM_GROUP);

    t.cpu.advance(crate::time::ns_to_ticks(50_000_000) + 1);
    core.handle_alarm_interrupt(t.default_thread(1).context());
    assert_eq!(w.state(mem), ThreadState::Ready);
    assert_eq!(armed[0].state(mem), AlarmState::Expired);
}

#[test]
fn signalling_a_timed_waiter_cancels_its_alarm() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let k = &t.k;
    let mem = t.k.mem();

    let e = OsEvent(t.alloc(OsEvent::SIZE, 4));
    core.init_event(e, false, EventMode::AutoReset);
    let w = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, w);
    core.wait_event_with_timeout(e, 50_000_000);

    let armed = t.queue_members_alarm(k.statics.alarm[1].alarm_queue);
    assert_eq!(armed.len(), 1);
    let alarm = armed[0];

    // Restore the waiter's link to its pending timeout
    w.set_wait_event_timeout_alarm(mem, alarm.addr());

    t.make_current(1, t.default_thread(1));
    core.signal_event(e);
    assert_eq!(alarm.state(mem), AlarmState::Idle);
    assert_ne!(w.state(mem), ThreadState::Waiting);
    assert_eq!(e.value(mem), 0);
}

#[test]
fn message_queue_ring_and_priorities() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let q = OsMessageQueue(t.alloc(OsMessageQueue::SIZE, 4));
    let storage = t.alloc(4 * OsMessage::SIZE, 4);
    core.init_message_queue(q, storage, 4);

    let msg = OsMessage(t.alloc(OsMessage::SIZE, 4));
    let out = OsMessage(t.alloc(OsMessage::SIZE, 4));

    for n in 1..=4u32 {
        msg.set_message(mem, n);
        assert!(core.send_message(q, msg, MessageFlags::empty()));
    }
    // Full: a non-blocking send fails
    msg.set_message(mem, 5);
    assert!(!core.send_message(q, msg, MessageFlags::empty()));

    assert!(core.receive_message(q, out, MessageFlags::empty()));
    assert_eq!(out.message(mem), 1);

    // High priority jumps the queue
    msg.set_message(mem, 6);
    assert!(core.send_message(q, msg, MessageFlags::HIGH_PRIORITY));
    assert!(core.peek_message(q, out));
    assert_eq!(out.message(mem), 6);

    let mut order = Vec::new();
    while core.receive_message(q, out, MessageFlags::empty()) {
        order.push(out.message(mem));
    }
    assert_eq!(order, vec![6, 2, 3, 4]);
}

#[test]
fn high_priority_send_wraps_index_zero() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let q = OsMessageQueue(t.alloc(OsMessageQueue::SIZE, 4));
    let storage = t.alloc(4 * OsMessage::SIZE, 4);
    core.init_message_queue(q, storage, 4);

    let msg = OsMessage(t.alloc(OsMessage::SIZE, 4));
    msg.set_message(mem, 9);
    assert!(core.send_message(q, msg, MessageFlags::HIGH_PRIORITY));
    // first was 0, so the message landed in the last ring slot
    assert_eq!(q.first(mem), 3);
    let slot = OsMessage(storage.offset(3 * OsMessage::SIZE));
    assert_eq!(slot.message(mem), 9);
}

#[test]
fn empty_receive_and_peek_fail_without_blocking() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let q = OsMessageQueue(t.alloc(OsMessageQueue::SIZE, 4));
    let storage = t.alloc(2 * OsMessage::SIZE, 4);
    core.init_message_queue(q, storage, 2);

    let out = OsMessage(t.alloc(OsMessage::SIZE, 4));
    assert!(!core.receive_message(q, out, MessageFlags::empty()));
    assert!(!core.peek_message(q, out));
}

#[test]
fn spin_lock_forces_priority_zero_while_held() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let a = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, a);

    let lock = OsSpinLock(t.alloc(OsSpinLock::SIZE, 4));
    core.init_spin_lock(lock);

    assert!(core.acquire_spin_lock(lock));
    assert_eq!(a.context().spin_lock_count(mem), 1);
    assert_eq!(a.priority(mem), 0);

    // Recursion does not double-count
    assert!(core.acquire_spin_lock(lock));
    assert_eq!(a.context().spin_lock_count(mem), 1);
    assert_eq!(lock.recursion(mem), 1);

    assert!(core.release_spin_lock(lock));
    assert_eq!(a.priority(mem), 0);
    assert!(core.release_spin_lock(lock));
    assert_eq!(a.context().spin_lock_count(mem), 0);
    assert_eq!(a.priority(mem), 20);
    assert!(lock.owner(mem).is_null());
}

#[test]
fn uninterruptible_spin_lock_masks_interrupts() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();
    let thread = core.current_thread();

    let lock = OsSpinLock(t.alloc(OsSpinLock::SIZE, 4));
    core.init_spin_lock(lock);

    assert!(core.interrupts_enabled());
    assert!(core.uninterruptible_spin_lock_acquire(lock));
    assert!(!core.interrupts_enabled());
    assert_ne!(thread.cancel_state(mem) & CancelState::DISABLED_BY_SPINLOCK.bits(), 0);

    assert!(core.uninterruptible_spin_lock_release(lock));
    assert!(core.interrupts_enabled());
    assert_eq!(thread.cancel_state(mem) & CancelState::DISABLED_BY_SPINLOCK.bits(), 0);
}

#[test]
fn spin_try_with_zero_timeout_fails_on_a_held_lock() {
    let t = TestKernel::new();
    let core1 = t.k.core(1);
    let core0 = t.k.core(0);

    let lock = OsSpinLock(t.alloc(OsSpinLock::SIZE, 4));
    core1.init_spin_lock(lock);

    let b = t.spawn_thread(&core1, 20, 0b001);
    core0.handle_reschedule_interrupt();
    assert_eq!(core0.current_thread(), b);
    assert!(core0.try_acquire_spin_lock(lock));

    assert!(!core1.try_acquire_spin_lock(lock));
    assert!(!core1.try_acquire_spin_lock_with_timeout(lock, 0));
}

#[test]
fn rendezvous_with_own_core_only_is_immediate() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let r = OsRendezvous(t.alloc(OsRendezvous::SIZE, 4));
    core.init_rendezvous(r);
    assert!(core.wait_rendezvous(r, 1 << 1));
    assert_eq!(r.core1(mem), 1);
    assert_eq!(r.core0(mem), 0);
}

#[test]
fn rendezvous_succeeds_once_all_flags_publish() {
    let t = TestKernel::new();
    let core1 = t.k.core(1);
    let core0 = t.k.core(0);

    let r = OsRendezvous(t.alloc(OsRendezvous::SIZE, 4));
    core1.init_rendezvous(r);

    // Core 0 arrives first; core 1 then waits on both
    assert!(core0.wait_rendezvous(r, 1 << 0));
    assert!(core1.wait_rendezvous(r, (1 << 0) | (1 << 1)));
}

#[test]
fn rendezvous_times_out_when_a_core_never_arrives() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let r = OsRendezvous(t.alloc(OsRendezvous::SIZE, 4));
    core.init_rendezvous(r);

    // Busy-wait polls advance the manual clock
    t.cpu.auto_advance.store(crate::time::ms_to_ticks(1), std::sync::atomic::Ordering::SeqCst);
    assert!(!core.wait_rendezvous_with_timeout(r, 1 << 0, 1_000_000));
}

#[test]
fn exit_releases_owned_fast_mutexes() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let a = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, a);

    let fm = OsFastMutex(t.alloc(OsFastMutex::SIZE, 4));
    core.init_fast_mutex(fm);
    core.lock_fast_mutex(fm);

    core.exit_thread(0);
    assert!(fm.owner(mem).is_null());
    assert!(a.fast_mutex_queue().head(mem).is_null());
}
