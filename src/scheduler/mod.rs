/*
 * Scheduler
 *
 * The single source of truth for which thread runs on each core. All
 * mutation happens under the scheduler id-lock; every function with a
 * `_no_lock` suffix expects the caller to hold it.
 *
 * Each core has a priority-sorted run queue of Ready threads. A thread is
 * queued on every core its affinity mask allows. Switching is cooperative:
 * `check_running_thread_no_lock` decides whether the current thread keeps
 * the core, re-queues it if not, and hands the core to the next thread
 * through the CPU abstraction.
 */

use crate::cpu::CORE_COUNT;
use crate::guest::list::{self, QueueRef};
use crate::guest::VirtAddr;
use crate::idlock;
use crate::thread::{
    OsThread, ThreadAttributes, ThreadRequest, ThreadState, ACTIVE_LINK, CORE_RUN_LINKS,
    STACK_SENTINEL, THREAD_LINK,
};
use crate::time;
use crate::{Core, Kernel};

/// Sentinel stored in `pause_time` while core time is not paused.
const NOT_PAUSED: i64 = i64::MAX;

pub fn lock(k: &Kernel, core: u32) {
    k.sched_lock.acquire(idlock::core_lock_id(core));
}

pub fn unlock(k: &Kernel, core: u32) {
    k.sched_lock.release(idlock::core_lock_id(core));
}

pub fn is_locked(k: &Kernel, core: u32) -> bool {
    k.sched_lock.is_held_by(idlock::core_lock_id(core))
}

pub fn is_enabled(k: &Kernel, core: u32) -> bool {
    k.mem().read_u32(k.statics.sched[core as usize].enabled) != 0
}

pub fn enable(k: &Kernel, core: u32) {
    k.mem().write_u32(k.statics.sched[core as usize].enabled, 1);
}

pub fn disable(k: &Kernel, core: u32) {
    k.mem().write_u32(k.statics.sched[core as usize].enabled, 0);
}

pub fn core_running_thread(k: &Kernel, core: u32) -> OsThread {
    OsThread(k.mem().read_addr(k.statics.sched[core as usize].current_thread))
}

pub fn set_core_running_thread(k: &Kernel, core: u32, thread: OsThread) {
    k.mem().write_addr(k.statics.sched[core as usize].current_thread, thread.addr());
}

pub fn first_active_thread(k: &Kernel) -> OsThread {
    OsThread(QueueRef(k.statics.active_queue).head(k.mem()))
}

fn run_queue(k: &Kernel, core: u32) -> QueueRef {
    QueueRef(k.statics.sched[core as usize].run_queue)
}

fn active_queue(k: &Kernel) -> QueueRef {
    QueueRef(k.statics.active_queue)
}

/// Sort predicate for every thread queue: effective priority ascending,
/// FIFO among equals.
pub(crate) fn thread_is_less(
    mem: &crate::guest::GuestMemory,
    lhs: VirtAddr,
    rhs: VirtAddr,
) -> bool {
    OsThread(lhs).priority(mem) <= OsThread(rhs).priority(mem)
}

impl<'k> Core<'k> {
    /// The thread currently running on this core, if any.
    pub fn current_thread(&self) -> OsThread {
        core_running_thread(self.k, self.id)
    }
}

fn validate_thread(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    if mem.read_u32(thread.stack_end(mem)) != STACK_SENTINEL {
        crate::thread::fatal_thread_error(k, thread, "stack overflow detected");
    }
    if thread.attr(mem) & ThreadAttributes::AFFINITY_ANY.bits() == 0 {
        crate::thread::fatal_thread_error(k, thread, "thread has no affinity");
    }
}

/// Walk the active list, validating every thread. Returns the count.
pub fn check_active_threads_no_lock(k: &Kernel) -> i32 {
    let mem = k.mem();
    let mut count = 0;
    let mut it = active_queue(k).head(mem);
    while !it.is_null() {
        validate_thread(k, OsThread(it));
        count += 1;
        it = list::next(mem, it, ACTIVE_LINK);
    }
    count
}

pub(crate) fn mark_thread_active_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    debug_assert!(!list::contains(mem, active_queue(k), thread.addr(), ACTIVE_LINK));
    list::append(mem, active_queue(k), thread.addr(), ACTIVE_LINK);
    check_active_threads_no_lock(k);
}

pub(crate) fn mark_thread_inactive_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    debug_assert!(list::contains(mem, active_queue(k), thread.addr(), ACTIVE_LINK));
    list::erase(mem, active_queue(k), thread.addr(), ACTIVE_LINK);
    check_active_threads_no_lock(k);
}

pub(crate) fn is_thread_active_no_lock(k: &Kernel, thread: OsThread) -> bool {
    let mem = k.mem();
    if thread.state(mem) == ThreadState::None {
        return false;
    }
    list::contains(mem, active_queue(k), thread.addr(), ACTIVE_LINK)
}

/// Queue a Ready thread on every core its affinity allows.
pub(crate) fn queue_thread_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    debug_assert!(thread.suspend_counter(mem) <= 0);
    debug_assert!(thread.state(mem) == ThreadState::Ready);

    let attr = thread.attr(mem);
    for core in 0..CORE_COUNT {
        if attr & (1 << core) != 0 {
            list::insert_sorted(
                mem,
                run_queue(k, core),
                thread.addr(),
                CORE_RUN_LINKS[core as usize],
                thread_is_less,
            );
        }
    }
}

pub(crate) fn unqueue_thread_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    for core in 0..CORE_COUNT {
        let q = run_queue(k, core);
        if list::contains(mem, q, thread.addr(), CORE_RUN_LINKS[core as usize]) {
            list::erase(mem, q, thread.addr(), CORE_RUN_LINKS[core as usize]);
        }
    }
}

pub(crate) fn set_thread_affinity_no_lock(k: &Kernel, thread: OsThread, affinity: u8) {
    let mem = k.mem();
    let attr = thread.attr(mem) & !ThreadAttributes::AFFINITY_ANY.bits();
    thread.set_attr(mem, attr | (affinity & ThreadAttributes::AFFINITY_ANY.bits()));

    if thread.state(mem) == ThreadState::Ready && thread.suspend_counter(mem) == 0 {
        unqueue_thread_no_lock(k, thread);
        queue_thread_no_lock(k, thread);
    }
}

fn peek_next_thread_no_lock(k: &Kernel, core: u32) -> OsThread {
    let mem = k.mem();
    let head = run_queue(k, core).head(mem);
    let thread = OsThread(head);
    if !thread.is_null() {
        debug_assert!(thread.state(mem) == ThreadState::Ready);
        debug_assert!(thread.suspend_counter(mem) == 0);
        debug_assert!(thread.attr(mem) & (1 << core) != 0);
    }
    thread
}

/// Decide whether the current thread keeps the core and perform the
/// context switch if not. `yielding` permits same-priority rotation.
pub fn check_running_thread_no_lock(core: &Core<'_>, yielding: bool) {
    let k = core.k;
    let id = core.id;
    let mem = k.mem();
    debug_assert!(is_locked(k, id));
    check_active_threads_no_lock(k);

    if !is_enabled(k, id) {
        return;
    }

    let curr = core_running_thread(k, id);
    let next = peek_next_thread_no_lock(k, id);
    if curr.is_null() && next.is_null() {
        // Idle core with nothing to run
        return;
    }

    let now = k.cpu().time_base();
    if !curr.is_null() {
        if curr.state(mem) == ThreadState::Running {
            if curr.suspend_counter(mem) <= 0 {
                if next.is_null() {
                    return;
                }
                if curr.priority(mem) < next.priority(mem) {
                    return;
                }
                if !yielding && curr.priority(mem) == next.priority(mem) {
                    return;
                }
            }

            curr.set_state(mem, ThreadState::Ready);
            queue_thread_no_lock(k, curr);
        }

        let ps = &k.statics.sched[id as usize];
        let elapsed = now - mem.read_i64(ps.last_switch);
        let consumed = curr.core_time_consumed_ns(mem) + time::ticks_to_ns(elapsed) as u64;
        curr.set_core_time_consumed_ns(mem, consumed);
    }

    log::trace!(
        "core {} leaving {} to {}",
        id,
        if curr.is_null() { "idle".into() } else { format!("thread {}", curr.id(mem)) },
        if next.is_null() { "idle".into() } else { format!("thread {}", next.id(mem)) },
    );

    if !next.is_null() {
        next.set_state(mem, ThreadState::Running);
        next.set_wake_count(mem, next.wake_count(mem) + 1);
        unqueue_thread_no_lock(k, next);
        // A running thread's core always matches its PIR
        next.context().set_pir(mem, id);
    }

    set_core_running_thread(k, id, next);
    mem.write_i64(k.statics.sched[id as usize].last_switch, now);

    let prev_interrupts = core.enable_interrupts();

    unlock(k, id);
    k.cpu().switch_context(
        id,
        if curr.is_null() { None } else { Some(curr.context().addr()) },
        if next.is_null() { None } else { Some(next.context().addr()) },
    );
    lock(k, id);

    core.restore_interrupts(prev_interrupts);
    check_active_threads_no_lock(k);
}

pub fn reschedule_self_no_lock(core: &Core<'_>) {
    check_running_thread_no_lock(core, false);
}

pub fn reschedule_no_lock(core: &Core<'_>, target: u32) {
    if target == core.id {
        reschedule_self_no_lock(core);
    } else {
        core.k.cpu().interrupt(target);
    }
}

pub fn reschedule_other_cores_no_lock(core: &Core<'_>) {
    for i in 0..CORE_COUNT {
        if i != core.id {
            reschedule_no_lock(core, i);
        }
    }
}

pub fn reschedule_all_cores_no_lock(core: &Core<'_>) {
    // Other cores first, or we might switch away before the interrupts go out
    reschedule_other_cores_no_lock(core);
    reschedule_self_no_lock(core);
}

/// Decrease a thread's suspend counter, re-queueing it when it hits zero.
/// Returns the previous counter value.
pub(crate) fn resume_thread_no_lock(k: &Kernel, thread: OsThread, counter: i32) -> i32 {
    let mem = k.mem();
    debug_assert!(is_thread_active_no_lock(k, thread));

    let old = thread.suspend_counter(mem);
    thread.set_suspend_counter(mem, old - counter);

    if thread.suspend_counter(mem) < 0 {
        thread.set_suspend_counter(mem, 0);
        return old;
    }

    if thread.suspend_counter(mem) == 0 && thread.state(mem) == ThreadState::Ready {
        thread.set_priority(mem, calculate_thread_priority_no_lock(k, thread));
        queue_thread_no_lock(k, thread);
    }

    old
}

pub(crate) fn suspend_thread_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    thread.set_request_flag(mem, ThreadRequest::None);
    thread.set_suspend_counter(mem, thread.suspend_counter(mem) + thread.need_suspend(mem));
    thread.set_need_suspend(mem, 0);
    thread.set_state(mem, ThreadState::Ready);
    wakeup_thread_no_lock(k, thread.suspend_queue().addr());
}

/// Honor a pending suspend or cancel request on the current thread.
pub(crate) fn test_thread_cancel_no_lock(core: &Core<'_>) {
    let k = core.k;
    let mem = k.mem();
    let thread = core.current_thread();
    if thread.is_null() {
        return;
    }

    if thread.cancel_state(mem) == 0 {
        if thread.request_flag(mem) == ThreadRequest::Suspend {
            suspend_thread_no_lock(k, thread);
            reschedule_all_cores_no_lock(core);
        }

        if thread.request_flag(mem) == ThreadRequest::Cancel {
            unlock(k, core.id);
            core.exit_thread(-1);
        }
    }
}

/// Wake one thread out of whatever queue it sleeps on.
pub(crate) fn wakeup_one_thread_no_lock(k: &Kernel, thread: OsThread) {
    let mem = k.mem();
    let state = thread.state(mem);
    if state == ThreadState::Running || state == ThreadState::Ready {
        return;
    }

    let queue = thread.queue(mem);
    debug_assert!(!queue.is_null());

    thread.set_state(mem, ThreadState::Ready);
    list::erase(mem, QueueRef(queue), thread.addr(), THREAD_LINK);
    thread.set_queue(mem, VirtAddr::NULL);
    queue_thread_no_lock(k, thread);
}

/// Wake every thread in a wait queue, in queue order.
pub(crate) fn wakeup_thread_no_lock(k: &Kernel, queue: VirtAddr) {
    let mem = k.mem();
    let mut it = QueueRef(queue).head(mem);
    while !it.is_null() {
        let next = list::next(mem, it, THREAD_LINK);
        wakeup_one_thread_no_lock(k, OsThread(it));
        it = next;
    }
}

pub(crate) fn wakeup_thread_wait_for_suspension_no_lock(
    k: &Kernel,
    queue: VirtAddr,
    suspend_result: i32,
) {
    let mem = k.mem();
    let mut it = QueueRef(queue).head(mem);
    while !it.is_null() {
        let next = list::next(mem, it, THREAD_LINK);
        let thread = OsThread(it);
        thread.set_suspend_result(mem, suspend_result);
        wakeup_one_thread_no_lock(k, thread);
        it = next;
    }
    list::clear(mem, QueueRef(queue), THREAD_LINK);
}

/// Put the current thread to sleep on a wait queue (null for a bare wait).
pub(crate) fn sleep_thread_no_lock(core: &Core<'_>, queue: VirtAddr) {
    let k = core.k;
    let mem = k.mem();
    let thread = core.current_thread();
    debug_assert!(thread.queue(mem).is_null());
    debug_assert!(thread.state(mem) == ThreadState::Running);

    thread.set_queue(mem, queue);
    thread.set_state(mem, ThreadState::Waiting);

    if !queue.is_null() {
        list::insert_sorted(mem, QueueRef(queue), thread.addr(), THREAD_LINK, thread_is_less);
    }
}

/// Effective priority: base, boosted by the head waiter of every owned
/// mutex and fast mutex, forced to 0 while holding a spin lock.
pub(crate) fn calculate_thread_priority_no_lock(k: &Kernel, thread: OsThread) -> i32 {
    let mem = k.mem();
    debug_assert!(k.sched_lock.is_held_by_someone());
    let mut priority = thread.base_priority(mem);

    if thread.context().spin_lock_count(mem) > 0 {
        return 0;
    }

    let mut mutex = thread.mutex_queue().head(mem);
    while !mutex.is_null() {
        // Head of the mutex wait queue is its highest-priority waiter
        let waiter = crate::sync::mutex::OsMutex(mutex).queue().head(mem);
        if !waiter.is_null() {
            priority = priority.min(OsThread(waiter).priority(mem));
        }
        mutex = mem.read_addr(mutex.offset(crate::sync::mutex::MUTEX_LINK.next));
    }

    let mut fm = thread.fast_mutex_queue().head(mem);
    while !fm.is_null() {
        let waiter = crate::sync::fastmutex::OsFastMutex(fm).queue().head(mem);
        if !waiter.is_null() {
            priority = priority.min(OsThread(waiter).priority(mem));
        }
        fm = mem.read_addr(fm.offset(crate::sync::fastmutex::FM_OWNED_LINK.next));
    }

    priority
}

/// Set a thread's effective priority, repositioning it in whatever queue
/// it occupies. If the thread is blocked on a mutex, returns the mutex
/// owner so the boost can be chained.
pub(crate) fn set_thread_actual_priority_no_lock(
    k: &Kernel,
    thread: OsThread,
    priority: i32,
) -> OsThread {
    let mem = k.mem();
    thread.set_priority(mem, priority);

    let state = thread.state(mem);
    if state == ThreadState::Ready {
        if thread.suspend_counter(mem) == 0 {
            unqueue_thread_no_lock(k, thread);
            queue_thread_no_lock(k, thread);
        }
    } else if state == ThreadState::Waiting {
        let queue = thread.queue(mem);
        if !queue.is_null() {
            list::erase(mem, QueueRef(queue), thread.addr(), THREAD_LINK);
            list::insert_sorted(mem, QueueRef(queue), thread.addr(), THREAD_LINK, thread_is_less);
        }

        let mutex = thread.mutex(mem);
        if !mutex.is_null() {
            return OsThread(crate::sync::mutex::OsMutex(mutex).owner(mem));
        }
    }

    OsThread::NULL
}

/// Recompute a thread's priority and walk the chain of mutex owners.
pub(crate) fn update_thread_priority_no_lock(k: &Kernel, thread: OsThread) {
    let mut t = thread;
    while !t.is_null() {
        let priority = calculate_thread_priority_no_lock(k, t);
        t = set_thread_actual_priority_no_lock(k, t, priority);
    }
}

/// Boost a chain of blocking owners up to (numerically down to) `priority`.
pub(crate) fn promote_thread_priority_no_lock(k: &Kernel, thread: OsThread, priority: i32) {
    let mem = k.mem();
    let mut t = thread;
    while !t.is_null() && priority < t.priority(mem) {
        t = set_thread_actual_priority_no_lock(k, t, priority);
    }
}

/// Time the current thread has been running on `core`, excluding debugger
/// pauses.
pub fn core_thread_running_time(k: &Kernel, core: u32) -> i64 {
    let mem = k.mem();
    let ps = &k.statics.sched[core as usize];
    let pause = mem.read_i64(ps.pause_time);
    let now = if pause != NOT_PAUSED { pause } else { k.cpu().time_base() };
    time::ticks_to_ns(now - mem.read_i64(ps.last_switch))
}

/// Freeze or thaw core-time accounting around a debugger pause.
pub fn pause_core_time(k: &Kernel, core: u32, paused: bool) {
    let mem = k.mem();
    let ps = &k.statics.sched[core as usize];
    let now = k.cpu().time_base();
    if paused {
        mem.write_i64(ps.pause_time, now);
    } else {
        let pause = mem.read_i64(ps.pause_time);
        let last = mem.read_i64(ps.last_switch);
        mem.write_i64(ps.last_switch, last + (now - pause));
        mem.write_i64(ps.pause_time, NOT_PAUSED);
    }
}

pub(crate) fn initialise(k: &Kernel) {
    let mem = k.mem();
    list::init(mem, active_queue(k));

    let now = k.cpu().time_base();
    for core in 0..CORE_COUNT as usize {
        let ps = &k.statics.sched[core];
        mem.write_u32(ps.enabled, 1);
        mem.write_addr(ps.current_thread, VirtAddr::NULL);
        list::init(mem, QueueRef(ps.run_queue));
        mem.write_i64(ps.last_switch, now);
        mem.write_i64(ps.pause_time, NOT_PAUSED);
    }
}
