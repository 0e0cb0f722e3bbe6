/*
 * Threads
 *
 * Guest-visible threads. The caller owns the 0x6A0-byte OSThread block;
 * the kernel never allocates one. Threads are created suspended, start at
 * a shared entry trampoline, and end up Moribund (awaiting join) or None.
 *
 * Each core also carries two system threads built here: the default
 * thread the core boots into, and the deallocator thread which runs
 * thread deallocator callbacks after a thread dies.
 */

use bitflags::bitflags;

use crate::alarm;
use crate::context::OsContext;
use crate::cpu::{CORE_COUNT, MAIN_CORE};
use crate::guest::list::{self, Link, QueueRef};
use crate::guest::{GuestMemory, VirtAddr};
use crate::scheduler;
use crate::sync;
use crate::time;
use crate::{Core, Kernel};

pub const THREAD_TAG: u32 = 0x7448_7244; // "tHrD"
pub const STACK_SENTINEL: u32 = 0xDEAD_BABE;
pub const STACK_USAGE_FILL: u32 = 0xFEFE_FEFE;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    None = 0,
    Ready = 1,
    Running = 2,
    Waiting = 4,
    Moribund = 8,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            4 => ThreadState::Waiting,
            8 => ThreadState::Moribund,
            _ => ThreadState::None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ThreadRequest {
    None = 0,
    Suspend = 1,
    Cancel = 2,
}

impl ThreadRequest {
    fn from_u32(v: u32) -> ThreadRequest {
        match v {
            1 => ThreadRequest::Suspend,
            2 => ThreadRequest::Cancel,
            _ => ThreadRequest::None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadType {
    Driver = 0,
    Io = 1,
    App = 2,
}

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct ThreadAttributes: u8 {
        const AFFINITY_CPU0 = 1 << 0;
        const AFFINITY_CPU1 = 1 << 1;
        const AFFINITY_CPU2 = 1 << 2;
        const AFFINITY_ANY = 0b111;
        const DETACHED = 1 << 3;
        const STACK_USAGE = 1 << 5;
    }
}

bitflags! {
    /// Cancellation is only allowed while every bit is clear.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct CancelState: u32 {
        const DISABLED = 1;
        const DISABLED_BY_MUTEX = 0x10000;
        const DISABLED_BY_SPINLOCK = 0x20000;
        const DISABLED_BY_USER_STACK_POINTER = 0x40000;
    }
}

guest_struct! {
    /// Doubly linked wait queue: head, tail, owning object.
    pub struct ThreadQueue : 0x10 {
        0x00 => head, set_head: addr;
        0x04 => tail, set_tail: addr;
        0x08 => parent, set_parent: addr;
    }
}

guest_struct! {
    pub struct ThreadSimpleQueue : 0x08 {
        0x00 => head, set_head: addr;
        0x04 => tail, set_tail: addr;
    }
}

guest_struct! {
    pub struct ThreadLink : 0x08 {
        0x00 => next, set_next: addr;
        0x04 => prev, set_prev: addr;
    }
}

guest_struct! {
    pub struct MutexQueue : 0x10 {
        0x00 => head, set_head: addr;
        0x04 => tail, set_tail: addr;
        0x08 => parent, set_parent: addr;
    }
}

guest_struct! {
    pub struct FastMutexQueue : 0x08 {
        0x00 => head, set_head: addr;
        0x04 => tail, set_tail: addr;
    }
}

guest_struct! {
    pub struct OsThread : 0x6A0 {
        0x000 => context: struct OsContext;
        0x320 => tag, set_tag: u32;
        0x324 => state_raw, set_state_raw: u8;
        0x325 => attr, set_attr: u8;
        0x326 => id, set_id: u16;
        0x328 => suspend_counter, set_suspend_counter: i32;
        0x32C => priority, set_priority: i32;
        0x330 => base_priority, set_base_priority: i32;
        0x334 => exit_value, set_exit_value: i32;
        0x35C => queue, set_queue: addr;
        0x360 => link: struct ThreadLink;
        0x368 => join_queue: struct ThreadQueue;
        0x378 => mutex, set_mutex: addr;
        0x37C => mutex_queue: struct MutexQueue;
        0x38C => active_link: struct ThreadLink;
        0x394 => stack_start, set_stack_start: addr;
        0x398 => stack_end, set_stack_end: addr;
        0x39C => entry_point, set_entry_point: addr;
        0x408 => eh_globals, set_eh_globals: addr;
        0x578 => alarm_cancelled, set_alarm_cancelled: u32;
        0x5BC => thread_type_raw, set_thread_type_raw: u32;
        0x5C0 => name, set_name: addr;
        0x5C4 => wait_event_timeout_alarm, set_wait_event_timeout_alarm: addr;
        0x5C8 => user_stack_pointer, set_user_stack_pointer: addr;
        0x5CC => cleanup_callback, set_cleanup_callback: addr;
        0x5D0 => deallocator, set_deallocator: addr;
        0x5D4 => cancel_state, set_cancel_state: u32;
        0x5D8 => request_flag_raw, set_request_flag_raw: u32;
        0x5DC => need_suspend, set_need_suspend: i32;
        0x5E0 => suspend_result, set_suspend_result: i32;
        0x5E4 => suspend_queue: struct ThreadQueue;
        0x5F8 => run_quantum_ticks, set_run_quantum_ticks: i64;
        0x600 => core_time_consumed_ns, set_core_time_consumed_ns: u64;
        0x608 => wake_count, set_wake_count: u64;
        0x664 => tls_section_count, set_tls_section_count: u16;
        0x668 => tls_sections, set_tls_sections: addr;
        0x66C => fast_mutex, set_fast_mutex: addr;
        0x670 => contended_fast_mutexes: struct FastMutexQueue;
        0x678 => fast_mutex_queue: struct FastMutexQueue;
    }
}

const OFF_SPECIFIC: u32 = 0x57C;

impl OsThread {
    #[inline]
    pub fn state(self, mem: &GuestMemory) -> ThreadState {
        ThreadState::from_u8(self.state_raw(mem))
    }

    #[inline]
    pub fn set_state(self, mem: &GuestMemory, state: ThreadState) {
        self.set_state_raw(mem, state as u8)
    }

    #[inline]
    pub fn request_flag(self, mem: &GuestMemory) -> ThreadRequest {
        ThreadRequest::from_u32(self.request_flag_raw(mem))
    }

    #[inline]
    pub fn set_request_flag(self, mem: &GuestMemory, r: ThreadRequest) {
        self.set_request_flag_raw(mem, r as u32)
    }

    /// Thread-specific slot, 0..16.
    pub fn specific(self, mem: &GuestMemory, slot: u32) -> u32 {
        assert!(slot < 16, "bad thread specific id {slot}");
        mem.read_u32(self.0.offset(OFF_SPECIFIC + slot * 4))
    }

    pub fn set_specific(self, mem: &GuestMemory, slot: u32, value: u32) {
        assert!(slot < 16, "bad thread specific id {slot}");
        mem.write_u32(self.0.offset(OFF_SPECIFIC + slot * 4), value)
    }

    pub fn affinity(self, mem: &GuestMemory) -> u8 {
        self.attr(mem) & ThreadAttributes::AFFINITY_ANY.bits()
    }
}

/// Wait-queue link of a thread.
pub const THREAD_LINK: Link = Link { next: 0x360, prev: 0x364 };
/// Active-list link of a thread.
pub const ACTIVE_LINK: Link = Link { next: 0x38C, prev: 0x390 };
/// Per-core run queue links.
pub const CORE_RUN_LINKS: [Link; 3] = [
    Link { next: 0x344, prev: 0x348 },
    Link { next: 0x34C, prev: 0x350 },
    Link { next: 0x354, prev: 0x358 },
];

pub(crate) fn fatal_thread_error(k: &Kernel, thread: OsThread, what: &str) -> ! {
    let mem = k.mem();
    let name = mem.read_cstr(thread.name(mem));
    log::error!(
        "fatal: {what}: thread {:#x} id {} [{}] state {:?} priority {}",
        thread.addr().0,
        thread.id(mem),
        name,
        thread.state(mem),
        thread.priority(mem),
    );
    panic!("{what} (thread id {})", thread.id(mem));
}

/// Write `value` over the unused part of a thread's stack. The saved
/// stack pointer bounds the live area.
fn clear_thread_stack_with_value(k: &Kernel, thread: OsThread, value: u32) {
    let mem = k.mem();
    let clear_end = thread.context().sp(mem);
    let mut addr = VirtAddr(thread.stack_end(mem).0 + 4);
    while addr < clear_end {
        mem.write_u32(addr, value);
        addr = addr.offset(4);
    }
}

/// Shared state initialisation for create_thread and run_thread.
#[allow(clippy::too_many_arguments)]
fn initialise_thread_state(
    k: &Kernel,
    thread: OsThread,
    entry: VirtAddr,
    argc: u32,
    argv: VirtAddr,
    stack: VirtAddr,
    stack_size: u32,
    priority: i32,
    pir: u32,
    thread_type: ThreadType,
) {
    let mem = k.mem();

    thread.set_priority(mem, priority);
    thread.set_base_priority(mem, priority);
    thread.set_tag(mem, THREAD_TAG);
    thread.set_suspend_result(mem, -1);
    thread.set_need_suspend(mem, 0);
    thread.set_exit_value(mem, -1);
    thread.set_thread_type_raw(mem, thread_type as u32);
    thread.set_state(mem, if entry.is_null() { ThreadState::None } else { ThreadState::Ready });
    thread.set_id(mem, 0x8000);
    thread.set_mutex(mem, VirtAddr::NULL);
    thread.set_deallocator(mem, VirtAddr::NULL);
    thread.set_core_time_consumed_ns(mem, 0);
    thread.set_cleanup_callback(mem, VirtAddr::NULL);
    thread.set_request_flag(mem, ThreadRequest::None);
    thread.set_fast_mutex(mem, VirtAddr::NULL);
    thread.set_wait_event_timeout_alarm(mem, VirtAddr::NULL);
    thread.set_run_quantum_ticks(mem, 0);
    thread.set_cancel_state(mem, 0);
    thread.set_entry_point(mem, entry);
    thread.set_suspend_counter(mem, if entry.is_null() { 0 } else { 1 });
    thread.set_eh_globals(mem, VirtAddr::NULL);
    thread.set_tls_section_count(mem, 0);
    thread.set_tls_sections(mem, VirtAddr::NULL);
    thread.contended_fast_mutexes().set_head(mem, VirtAddr::NULL);
    thread.contended_fast_mutexes().set_tail(mem, VirtAddr::NULL);
    thread.fast_mutex_queue().set_head(mem, VirtAddr::NULL);
    thread.fast_mutex_queue().set_tail(mem, VirtAddr::NULL);
    thread.mutex_queue().set_head(mem, VirtAddr::NULL);
    thread.mutex_queue().set_tail(mem, VirtAddr::NULL);
    thread.mutex_queue().set_parent(mem, thread.addr());
    thread.set_alarm_cancelled(mem, 0);
    for slot in 0..16 {
        thread.set_specific(mem, slot, 0);
    }
    thread.set_wake_count(mem, 0);
    init_thread_queue_ex(mem, thread.join_queue(), thread.addr());
    init_thread_queue_ex(mem, thread.suspend_queue(), thread.addr());

    // Stack: top at the highest address, sentinel at the lowest
    let stack_init = stack.align_down(8);
    mem.write_u32(VirtAddr(stack_init.0 - 4), 0);
    mem.write_u32(VirtAddr(stack_init.0 - 8), 0);

    thread.set_stack_start(mem, stack);
    thread.set_stack_end(mem, VirtAddr(stack.0 - stack_size));
    mem.write_u32(thread.stack_end(mem), STACK_SENTINEL);

    let ctx = thread.context();
    ctx.init(mem, k.builtins.thread_entry, VirtAddr(stack_init.0 - 8));
    ctx.set_pir(mem, pir);
    ctx.set_gpr(mem, 3, argc);
    ctx.set_gpr(mem, 4, argv.0);
    ctx.set_fpscr(mem, 4);
    ctx.set_gqr(mem, 2, 0x40004);
    ctx.set_gqr(mem, 3, 0x50005);
    ctx.set_gqr(mem, 4, 0x60006);
    ctx.set_gqr(mem, 5, 0x70007);
    for core in 0..CORE_COUNT {
        ctx.set_coretime(mem, core, 0);
    }
}

pub(crate) fn init_thread_queue_ex(mem: &GuestMemory, q: ThreadQueue, parent: VirtAddr) {
    q.set_head(mem, VirtAddr::NULL);
    q.set_tail(mem, VirtAddr::NULL);
    q.set_parent(mem, parent);
}

impl<'k> Core<'k> {
    /// Initialise a thread queue object.
    pub fn init_thread_queue(&self, queue: ThreadQueue) {
        init_thread_queue_ex(self.mem(), queue, VirtAddr::NULL);
    }

    pub fn init_thread_queue_with_parent(&self, queue: ThreadQueue, parent: VirtAddr) {
        init_thread_queue_ex(self.mem(), queue, parent);
    }

    /// Create a new thread. The thread starts suspended; `resume_thread`
    /// makes it runnable.
    #[allow(clippy::too_many_arguments)]
    pub fn create_thread(
        &self,
        thread: OsThread,
        entry: VirtAddr,
        argc: u32,
        argv: VirtAddr,
        stack: VirtAddr,
        stack_size: u32,
        priority: i32,
        attributes: ThreadAttributes,
    ) -> bool {
        self.create_thread_type(
            thread, entry, argc, argv, stack, stack_size, priority, attributes,
            ThreadType::App,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_thread_type(
        &self,
        thread: OsThread,
        entry: VirtAddr,
        argc: u32,
        argv: VirtAddr,
        stack: VirtAddr,
        stack_size: u32,
        priority: i32,
        attributes: ThreadAttributes,
        thread_type: ThreadType,
    ) -> bool {
        let k = self.k;
        let mem = self.mem();
        let current = self.current_thread();

        // No affinity requested: inherit the caller's
        let mut attributes = attributes;
        if (attributes & ThreadAttributes::AFFINITY_ANY).is_empty() {
            let inherited = if current.is_null() {
                ThreadAttributes::AFFINITY_ANY.bits()
            } else {
                current.affinity(mem)
            };
            attributes |= ThreadAttributes::from_bits_retain(inherited);
        }

        scheduler::lock(k, self.id);
        mem.fill(thread.addr(), OsThread::SIZE, 0);
        initialise_thread_state(
            k, thread, entry, argc, argv, stack, stack_size, priority, self.id, thread_type,
        );
        thread.set_name(mem, VirtAddr::NULL);
        thread.context().set_attr(
            mem,
            (attributes & ThreadAttributes::AFFINITY_ANY).bits() as u32,
        );
        thread.set_attr(mem, attributes.bits());
        thread.set_id(mem, k.allocate_thread_id());

        if !current.is_null() {
            crate::exception::copy_thread_callbacks(mem, current, thread);
            let fpscr = thread.context().fpscr(mem) | (current.context().fpscr(mem) & 0xF8);
            thread.context().set_fpscr(mem, fpscr);
        }

        if !entry.is_null() {
            scheduler::mark_thread_active_no_lock(k, thread);
        }

        scheduler::unlock(k, self.id);

        log::info!(
            "thread created: ptr {:#010x}, id {:#x}, basePriority {}, attr {:#04x}, entry {:#010x}, stack {:#010x}-{:#010x}",
            thread.addr().0,
            thread.id(mem),
            thread.base_priority(mem),
            thread.attr(mem),
            entry.0,
            thread.stack_end(mem).0,
            thread.stack_start(mem).0,
        );

        true
    }

    /// Restart a terminated thread with a new entry point.
    pub fn run_thread(&self, thread: OsThread, entry: VirtAddr, argc: u32, argv: VirtAddr) -> bool {
        let k = self.k;
        let mem = self.mem();
        let mut result = false;
        scheduler::lock(k, self.id);

        if self.is_thread_terminated(thread) {
            if thread.state(mem) == ThreadState::Moribund {
                scheduler::mark_thread_inactive_no_lock(k, thread);
            }

            let stack_size = thread.stack_start(mem).0 - thread.stack_end(mem).0;
            let pir = thread.context().pir(mem);
            let thread_type = match thread.thread_type_raw(mem) {
                0 => ThreadType::Driver,
                1 => ThreadType::Io,
                _ => ThreadType::App,
            };
            initialise_thread_state(
                k,
                thread,
                entry,
                argc,
                argv,
                thread.stack_start(mem),
                stack_size,
                thread.base_priority(mem),
                pir,
                thread_type,
            );
            scheduler::mark_thread_active_no_lock(k, thread);
            scheduler::resume_thread_no_lock(k, thread, 1);
            scheduler::reschedule_all_cores_no_lock(self);
            result = true;
        }

        scheduler::unlock(k, self.id);
        result
    }

    /// Exit the current thread. After this call the thread's context is
    /// never scheduled again; callers must not continue using the thread.
    pub fn exit_thread(&self, value: i32) {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();

        let cleanup = thread.cleanup_callback(mem);
        if !cleanup.is_null() {
            thread.set_cancel_state(mem, thread.cancel_state(mem) | CancelState::DISABLED.bits());
            k.invoke_guest(self.id, cleanup, [thread.addr().0, thread.stack_end(mem).0, 0, 0]);
        }

        // Drop any TLS data owned by this thread
        if !thread.tls_sections(mem).is_null() {
            thread.set_tls_section_count(mem, 0);
            thread.set_tls_sections(mem, VirtAddr::NULL);
        }

        let old_interrupts = self.disable_interrupts();
        scheduler::lock(k, self.id);
        self.exit_thread_no_lock(value);
        scheduler::unlock(k, self.id);
        self.restore_interrupts(old_interrupts);
    }

    fn exit_thread_no_lock(&self, value: i32) {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();

        debug_assert!(thread.state(mem) == ThreadState::Running);
        debug_assert!(scheduler::is_thread_active_no_lock(k, thread));

        if thread.attr(mem) & ThreadAttributes::DETACHED.bits() != 0 {
            scheduler::mark_thread_inactive_no_lock(k, thread);
            thread.set_state(mem, ThreadState::None);

            if !thread.deallocator(mem).is_null() {
                queue_thread_deallocation(self, thread);
            }
        } else {
            thread.set_exit_value(mem, value);
            thread.set_state(mem, ThreadState::Moribund);
        }

        scheduler::disable(k, self.id);
        sync::mutex::unlock_all_no_lock(k, thread);
        sync::fastmutex::unlock_all_no_lock(k, thread);
        scheduler::wakeup_thread_no_lock(k, thread.join_queue().addr());
        scheduler::wakeup_thread_wait_for_suspension_no_lock(k, thread.suspend_queue().addr(), -1);
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::enable(k, self.id);

        scheduler::reschedule_self_no_lock(self);
    }

    /// Detach a thread; a Moribund thread is reaped immediately.
    pub fn detach_thread(&self, thread: OsThread) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        thread.set_attr(mem, thread.attr(mem) | ThreadAttributes::DETACHED.bits());

        if thread.state(mem) == ThreadState::Moribund {
            scheduler::mark_thread_inactive_no_lock(k, thread);

            if !thread.deallocator(mem).is_null() {
                queue_thread_deallocation(self, thread);
            }

            thread.set_state(mem, ThreadState::None);
        }

        scheduler::wakeup_thread_no_lock(k, thread.join_queue().addr());
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
    }

    /// Wait for a thread to terminate and collect its exit value.
    pub fn join_thread(&self, thread: OsThread, out_exit_value: Option<&mut i32>) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(scheduler::is_thread_active_no_lock(k, thread));

        // Only one joiner is allowed
        if thread.state(mem) != ThreadState::Moribund && thread.join_queue().head(mem).is_null() {
            scheduler::sleep_thread_no_lock(self, thread.join_queue().addr());
            scheduler::reschedule_self_no_lock(self);

            if !scheduler::is_thread_active_no_lock(k, thread) {
                // The thread raced to None via detach
                scheduler::unlock(k, self.id);
                return false;
            }
        }

        if thread.state(mem) != ThreadState::Moribund {
            scheduler::unlock(k, self.id);
            return false;
        }

        if let Some(out) = out_exit_value {
            *out = thread.exit_value(mem);
        }

        scheduler::mark_thread_inactive_no_lock(k, thread);
        thread.set_state(mem, ThreadState::None);

        if !thread.deallocator(mem).is_null() {
            queue_thread_deallocation(self, thread);
            scheduler::reschedule_self_no_lock(self);
        }

        scheduler::unlock(k, self.id);
        true
    }

    /// Request cancellation; the thread dies at its next cancellation point.
    pub fn cancel_thread(&self, thread: OsThread) {
        let k = self.k;
        let mem = self.mem();
        let mut reschedule = false;
        scheduler::lock(k, self.id);

        if thread.request_flag(mem) == ThreadRequest::Suspend {
            scheduler::wakeup_thread_wait_for_suspension_no_lock(
                k,
                thread.suspend_queue().addr(),
                -1,
            );
            reschedule = true;
        }

        if thread.suspend_counter(mem) != 0 && thread.cancel_state(mem) == 0 {
            scheduler::resume_thread_no_lock(k, thread, thread.suspend_counter(mem));
            reschedule = true;
        }

        if reschedule {
            scheduler::reschedule_all_cores_no_lock(self);
        }

        thread.set_suspend_counter(mem, 0);
        thread.set_need_suspend(mem, 0);
        thread.set_request_flag(mem, ThreadRequest::Cancel);
        scheduler::unlock(k, self.id);

        if self.current_thread() == thread && thread.cancel_state(mem) == 0 {
            self.exit_thread(-1);
        }
    }

    pub fn test_thread_cancel(&self) {
        scheduler::lock(self.k, self.id);
        scheduler::test_thread_cancel_no_lock(self);
        scheduler::unlock(self.k, self.id);
    }

    /// Increment a thread's suspend counter. Returns the previous value,
    /// or -1 if the thread cannot be suspended.
    pub fn suspend_thread(&self, thread: OsThread) -> i32 {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        let mut result = -1;

        let state = thread.state(mem);
        if state == ThreadState::Moribund || state == ThreadState::None {
            scheduler::unlock(k, self.id);
            return -1;
        }

        if thread.request_flag(mem) == ThreadRequest::Cancel {
            scheduler::unlock(k, self.id);
            return -1;
        }

        if self.current_thread() == thread {
            if thread.cancel_state(mem) == 0 {
                thread.set_need_suspend(mem, thread.need_suspend(mem) + 1);
                result = thread.suspend_counter(mem);
                scheduler::suspend_thread_no_lock(k, thread);
                scheduler::reschedule_all_cores_no_lock(self);
            }
        } else if thread.suspend_counter(mem) != 0 {
            result = thread.suspend_counter(mem);
            thread.set_suspend_counter(mem, result + 1);
        } else {
            thread.set_need_suspend(mem, thread.need_suspend(mem) + 1);
            thread.set_request_flag(mem, ThreadRequest::Suspend);
            scheduler::sleep_thread_no_lock(self, thread.suspend_queue().addr());
            scheduler::reschedule_self_no_lock(self);
            result = thread.suspend_result(mem);
        }

        scheduler::unlock(k, self.id);
        result
    }

    /// Decrement a thread's suspend counter, resuming it at zero. Returns
    /// the previous counter value.
    pub fn resume_thread(&self, thread: OsThread) -> i32 {
        let k = self.k;
        scheduler::lock(k, self.id);
        let old = scheduler::resume_thread_no_lock(k, thread, 1);

        if old - 1 == 0 {
            scheduler::reschedule_all_cores_no_lock(self);
        }

        scheduler::unlock(k, self.id);
        old
    }

    /// Clear a thread's suspend counter entirely.
    pub fn continue_thread(&self, thread: OsThread) {
        let k = self.k;
        scheduler::lock(k, self.id);
        scheduler::resume_thread_no_lock(k, thread, thread.suspend_counter(self.mem()));
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
    }

    /// Yield to a ready thread of the same or higher priority.
    pub fn yield_thread(&self) {
        scheduler::lock(self.k, self.id);
        scheduler::check_running_thread_no_lock(self, true);
        scheduler::unlock(self.k, self.id);
    }

    /// Sleep on a queue until `wakeup_thread` is called on it.
    pub fn sleep_thread(&self, queue: ThreadQueue) {
        scheduler::lock(self.k, self.id);
        scheduler::sleep_thread_no_lock(self, queue.addr());
        scheduler::reschedule_self_no_lock(self);
        scheduler::unlock(self.k, self.id);
    }

    /// Wake every thread sleeping on a queue.
    pub fn wakeup_thread(&self, queue: ThreadQueue) {
        scheduler::lock(self.k, self.id);
        scheduler::wakeup_thread_no_lock(self.k, queue.addr());
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(self.k, self.id);
    }

    /// Sleep for a duration using a one-shot system alarm.
    pub fn sleep_ticks(&self, ticks: i64) {
        let k = self.k;
        // Alarm and wait queue live in stack scratch for the duration
        k.with_stack_alloc(self.id, alarm::OsAlarm::SIZE + ThreadQueue::SIZE, |scratch| {
            let a = alarm::OsAlarm(scratch);
            let queue = ThreadQueue(scratch.offset(alarm::OsAlarm::SIZE));

            self.create_alarm(a);
            self.init_thread_queue(queue);

            scheduler::lock(k, self.id);
            alarm::set_alarm_internal(self, a, ticks, k.builtins.sleep_alarm_handler, self.current_thread().addr());
            scheduler::sleep_thread_no_lock(self, queue.addr());
            scheduler::reschedule_self_no_lock(self);
            scheduler::unlock(k, self.id);
        });
    }

    /// Current guest stack pointer of the running thread.
    pub fn stack_pointer(&self) -> VirtAddr {
        self.current_thread().context().sp(self.mem())
    }

    /// A thread's neighbours in the active-thread list.
    pub fn active_thread_link(&self, thread: OsThread) -> (OsThread, OsThread) {
        let mem = self.mem();
        (
            OsThread(thread.active_link().next(mem)),
            OsThread(thread.active_link().prev(mem)),
        )
    }

    /// Dump the running thread's identity and register context to the log.
    pub fn print_current_thread_state(&self) {
        let mem = self.mem();
        let thread = self.current_thread();
        if thread.is_null() {
            return;
        }

        let ctx = thread.context();
        log::info!("id    = {}", thread.id(mem));
        let name = thread.name(mem);
        if !name.is_null() {
            log::info!("name  = {}", mem.read_cstr(name));
        }
        log::info!("state = {:?}", thread.state(mem));
        log::info!("cia   = {:#010x}", ctx.srr0(mem));
        log::info!("lr    = {:#010x}", ctx.lr(mem));
        log::info!("cr    = {:#010x}", ctx.cr(mem));
        log::info!("ctr   = {:#010x}", ctx.ctr(mem));
        log::info!("xer   = {:#010x}", ctx.xer(mem));
        for n in 0..32 {
            log::info!("r{n:<2}   = {:#010x}", ctx.gpr(mem, n));
        }
        log::info!("fpscr = {:#010x}", ctx.fpscr(mem));
    }

    pub fn is_thread_suspended(&self, thread: OsThread) -> bool {
        thread.suspend_counter(self.mem()) > 0
    }

    pub fn is_thread_terminated(&self, thread: OsThread) -> bool {
        let state = thread.state(self.mem());
        state == ThreadState::None || state == ThreadState::Moribund
    }

    pub fn default_thread(&self, core: u32) -> Option<OsThread> {
        if core >= CORE_COUNT {
            return None;
        }
        Some(OsThread(self.k.statics.thread[core as usize].default_thread))
    }

    pub fn thread_name(&self, thread: OsThread) -> VirtAddr {
        thread.name(self.mem())
    }

    pub fn set_thread_name(&self, thread: OsThread, name: VirtAddr) {
        thread.set_name(self.mem(), name);
    }

    pub fn thread_priority(&self, thread: OsThread) -> i32 {
        thread.base_priority(self.mem())
    }

    /// Change a thread's base priority. Fails for priorities above 31.
    pub fn set_thread_priority(&self, thread: OsThread, priority: i32) -> bool {
        if priority > 31 {
            return false;
        }

        let k = self.k;
        scheduler::lock(k, self.id);
        thread.set_base_priority(self.mem(), priority);
        scheduler::update_thread_priority_no_lock(k, thread);
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
        true
    }

    pub fn thread_affinity(&self, thread: OsThread) -> u8 {
        thread.affinity(self.mem())
    }

    pub fn set_thread_affinity(&self, thread: OsThread, affinity: u8) -> bool {
        let k = self.k;
        scheduler::lock(k, self.id);
        scheduler::set_thread_affinity_no_lock(k, thread, affinity);

        if thread.state(self.mem()) == ThreadState::Ready && affinity != 0 {
            scheduler::reschedule_all_cores_no_lock(self);
        }

        scheduler::unlock(k, self.id);
        true
    }

    pub fn thread_specific(&self, slot: u32) -> u32 {
        self.current_thread().specific(self.mem(), slot)
    }

    pub fn set_thread_specific(&self, slot: u32, value: u32) {
        self.current_thread().set_specific(self.mem(), slot, value)
    }

    /// Enable or disable cancellation for the current thread. Returns the
    /// previous enable state.
    pub fn set_thread_cancel_state(&self, enabled: bool) -> bool {
        let mem = self.mem();
        let thread = self.current_thread();
        let old = thread.cancel_state(mem) & CancelState::DISABLED.bits() == 0;

        if enabled {
            thread.set_cancel_state(mem, thread.cancel_state(mem) & !CancelState::DISABLED.bits());
        } else {
            thread.set_cancel_state(mem, thread.cancel_state(mem) | CancelState::DISABLED.bits());
        }

        old
    }

    pub fn set_thread_cleanup_callback(&self, thread: OsThread, callback: VirtAddr) -> VirtAddr {
        let k = self.k;
        scheduler::lock(k, self.id);
        let old = thread.cleanup_callback(self.mem());
        thread.set_cleanup_callback(self.mem(), callback);
        scheduler::unlock(k, self.id);
        old
    }

    pub fn set_thread_deallocator(&self, thread: OsThread, deallocator: VirtAddr) -> VirtAddr {
        let k = self.k;
        scheduler::lock(k, self.id);
        let old = thread.deallocator(self.mem());
        thread.set_deallocator(self.mem(), deallocator);
        scheduler::unlock(k, self.id);
        old
    }

    /// Watermark the unused stack so `check_thread_stack_usage` can
    /// measure the high-water mark.
    pub fn set_thread_stack_usage(&self, thread: OsThread) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        let target = if thread.is_null() { self.current_thread() } else { thread };
        if target != self.current_thread() && target.state(mem) == ThreadState::Running {
            scheduler::unlock(k, self.id);
            return false;
        }

        clear_thread_stack_with_value(k, target, STACK_USAGE_FILL);
        target.set_attr(mem, target.attr(mem) | ThreadAttributes::STACK_USAGE.bits());
        scheduler::unlock(k, self.id);
        true
    }

    /// Bytes of stack the thread has ever used, measured against the
    /// watermark fill.
    pub fn check_thread_stack_usage(&self, thread: OsThread) -> i32 {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        let mut addr = VirtAddr(thread.stack_end(mem).0 + 4);
        let top = thread.stack_start(mem);
        while addr < top {
            if mem.read_u32(addr) != STACK_USAGE_FILL {
                break;
            }
            addr = addr.offset(4);
        }

        let result = (top.0 - addr.0) as i32;
        scheduler::unlock(k, self.id);
        result
    }

    pub fn clear_thread_stack_usage(&self, thread: OsThread) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        let target = if thread.is_null() { self.current_thread() } else { thread };
        target.set_attr(mem, target.attr(mem) & !ThreadAttributes::STACK_USAGE.bits());
        scheduler::unlock(k, self.id);
    }

    /// Fill the unused part of the current stack with `value`.
    pub fn clear_stack(&self, value: u32) {
        let mem = self.mem();
        let thread = self.current_thread();
        let sp = thread.context().sp(mem);
        let mut addr = VirtAddr(thread.stack_end(mem).0 + 4);
        while addr < sp {
            mem.write_u32(addr, value);
            addr = addr.offset(4);
        }
    }

    pub fn check_active_threads(&self) -> i32 {
        scheduler::lock(self.k, self.id);
        let count = scheduler::check_active_threads_no_lock(self.k);
        scheduler::unlock(self.k, self.id);
        count
    }

    /// Install a temporary user stack pointer; cancellation is blocked
    /// while it is active.
    pub fn set_user_stack_pointer(&self, stack: VirtAddr) {
        let mem = self.mem();
        let thread = self.current_thread();

        if stack >= thread.stack_end(mem) && stack < thread.stack_start(mem) {
            // Still inside the current stack frame
            return;
        }

        let current = thread.context().sp(mem);
        if current < thread.stack_end(mem) || current >= thread.stack_start(mem) {
            // Already on a user stack
            return;
        }

        thread.set_user_stack_pointer(mem, stack);
        self.test_thread_cancel();
        thread.set_cancel_state(
            mem,
            thread.cancel_state(mem) | CancelState::DISABLED_BY_USER_STACK_POINTER.bits(),
        );
    }

    pub fn remove_user_stack_pointer(&self, stack: VirtAddr) {
        let mem = self.mem();
        let thread = self.current_thread();

        if stack < thread.stack_end(mem) || stack >= thread.stack_start(mem) {
            return;
        }

        thread.set_cancel_state(
            mem,
            thread.cancel_state(mem) & !CancelState::DISABLED_BY_USER_STACK_POINTER.bits(),
        );
        thread.set_user_stack_pointer(mem, VirtAddr::NULL);
        self.test_thread_cancel();
    }

    pub fn user_stack_pointer(&self, thread: OsThread) -> VirtAddr {
        let k = self.k;
        let mem = self.mem();
        let mut stack = VirtAddr::NULL;
        scheduler::lock(k, self.id);

        if self.is_thread_suspended(thread) {
            stack = thread.user_stack_pointer(mem);
            if stack.is_null() {
                stack = thread.context().sp(mem);
            }
        }

        scheduler::unlock(k, self.id);
        stack
    }

    /// Restrict the current thread to this core, returning the previous
    /// affinity for `unpin_thread_affinity`.
    pub fn pin_thread_affinity(&self) -> u8 {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();
        scheduler::lock(k, self.id);
        let old = thread.affinity(mem);
        let attr = thread.attr(mem) & !ThreadAttributes::AFFINITY_ANY.bits();
        thread.set_attr(mem, attr | (1 << self.id));
        scheduler::unlock(k, self.id);
        old
    }

    pub fn unpin_thread_affinity(&self, affinity: u8) {
        let k = self.k;
        let mem = self.mem();
        let thread = self.current_thread();
        scheduler::lock(k, self.id);
        let attr = thread.attr(mem) & !ThreadAttributes::AFFINITY_ANY.bits();
        thread.set_attr(mem, attr | (affinity & ThreadAttributes::AFFINITY_ANY.bits()));
        scheduler::unlock(k, self.id);
    }

    /// The run-quantum API is accepted but its semantics are not wired up.
    pub fn set_thread_run_quantum(&self, thread: OsThread, quantum_us: u32) -> bool {
        const INFINITE: u32 = 0;
        const MIN_US: u32 = 100;
        const MAX_US: u32 = 1_000_000;

        if quantum_us != INFINITE && !(MIN_US..=MAX_US).contains(&quantum_us) {
            return false;
        }

        let _ticks = time::us_to_ticks(quantum_us as i64);
        let _ = thread;
        scheduler::lock(self.k, self.id);
        scheduler::unlock(self.k, self.id);
        panic!("set_thread_run_quantum: quantum scheduling is not supported");
    }
}

/// Queue a dead thread for its deallocator callback on this core.
pub(crate) fn queue_thread_deallocation(core: &Core<'_>, thread: OsThread) {
    let k = core.k;
    let mem = core.mem();
    let pc = &k.statics.thread[core.id as usize];
    list::insert_sorted(
        mem,
        QueueRef(pc.dealloc_queue),
        thread.addr(),
        THREAD_LINK,
        scheduler::thread_is_less,
    );
    scheduler::wakeup_thread_no_lock(k, pc.dealloc_thread_queue);
}

/// Run one queued deallocator callback; false when the queue is empty.
/// The deallocator thread loops over this, sleeping between batches.
pub(crate) fn deallocator_step(core: &Core<'_>) -> bool {
    let k = core.k;
    let mem = core.mem();
    let pc = &k.statics.thread[core.id as usize];

    let thread = OsThread(list::pop_front(mem, QueueRef(pc.dealloc_queue), THREAD_LINK));
    if thread.is_null() {
        return false;
    }

    let deallocator = thread.deallocator(mem);
    if !deallocator.is_null() {
        k.invoke_guest(
            core.id,
            deallocator,
            [thread.addr().0, thread.stack_end(mem).0, 0, 0],
        );
    }
    true
}

pub(crate) fn builtin_thread_entry(k: &Kernel, core: u32, args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let thread = view.current_thread();

    // Exception-handling state starts clean for every thread
    let interrupts = view.disable_interrupts();
    thread.set_eh_globals(mem, VirtAddr::NULL);
    view.restore_interrupts(interrupts);

    let entry = thread.entry_point(mem);
    let ret = k.invoke_guest(core, entry, [args[0], args[1], 0, 0]);
    view.exit_thread(ret as i32);
    ret
}

pub(crate) fn builtin_default_thread_entry(k: &Kernel, core: u32, _args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let mask = mem.read_u32(k.statics.rendezvous_mask);
    view.wait_rendezvous(sync::rendezvous::OsRendezvous(k.statics.rendezvous), mask);
    view.exit_thread(0);
    0
}

pub(crate) fn builtin_deallocator_thread_entry(k: &Kernel, core: u32, _args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let pc = &k.statics.thread[core as usize];

    let mut interrupts = view.disable_interrupts();
    loop {
        if !deallocator_step_with_interrupts(&view, &mut interrupts) {
            scheduler::lock(k, core);
            scheduler::sleep_thread_no_lock(&view, pc.dealloc_thread_queue);
            scheduler::reschedule_self_no_lock(&view);
            scheduler::unlock(k, core);
        }
    }
}

fn deallocator_step_with_interrupts(core: &Core<'_>, interrupts: &mut bool) -> bool {
    let k = core.k;
    let mem = core.mem();
    let pc = &k.statics.thread[core.id as usize];

    let thread = OsThread(list::pop_front(mem, QueueRef(pc.dealloc_queue), THREAD_LINK));
    if thread.is_null() {
        return false;
    }

    let deallocator = thread.deallocator(mem);
    if !deallocator.is_null() {
        core.restore_interrupts(*interrupts);
        k.invoke_guest(
            core.id,
            deallocator,
            [thread.addr().0, thread.stack_end(mem).0, 0, 0],
        );
        *interrupts = core.disable_interrupts();
    }
    true
}

pub(crate) fn builtin_sleep_alarm_handler(k: &Kernel, _core: u32, args: [u32; 4]) -> u32 {
    // System alarm: the scheduler lock is already held
    let a = alarm::OsAlarm(VirtAddr(args[0]));
    let thread = OsThread(a.user_data(k.mem()));
    scheduler::wakeup_one_thread_no_lock(k, thread);
    0
}

fn initialise_default_thread(k: &Kernel, core: u32) {
    let mem = k.mem();
    let pc = &k.statics.thread[core as usize];
    let thread = OsThread(pc.default_thread);

    mem.write_cstr(pc.default_name, 32, &format!("Default Thread {core}"));
    thread.set_name(mem, pc.default_name);
    thread.set_tag(mem, THREAD_TAG);
    thread.set_exit_value(mem, -1);
    thread.set_thread_type_raw(mem, ThreadType::App as u32);
    thread.set_attr(mem, ThreadAttributes::DETACHED.bits() | (1 << core));
    thread.set_state(mem, ThreadState::Running);
    thread.set_priority(mem, 80);
    thread.set_base_priority(mem, 80);
    thread.set_id(mem, k.allocate_thread_id());

    init_thread_queue_ex(mem, thread.join_queue(), thread.addr());
    init_thread_queue_ex(mem, thread.suspend_queue(), thread.addr());
    thread.mutex_queue().set_parent(mem, thread.addr());

    let stack_top = VirtAddr(pc.default_stack.0 + DEFAULT_THREAD_STACK_SIZE);
    thread.set_stack_start(mem, stack_top);
    thread.set_stack_end(mem, pc.default_stack);

    let ctx = thread.context();
    if core == MAIN_CORE {
        // The main core's context is live; it has no fresh entry point
        ctx.init(mem, VirtAddr::NULL, stack_top);
    } else {
        ctx.init(mem, k.builtins.default_thread_entry, stack_top);
    }

    ctx.set_pir(mem, core);
    ctx.set_starttime(mem, k.system_time());
    ctx.set_attr(mem, 1 << core);
    ctx.set_gqr(mem, 2, 0x40004);
    ctx.set_gqr(mem, 3, 0x50005);
    ctx.set_gqr(mem, 4, 0x60006);
    ctx.set_gqr(mem, 5, 0x70007);

    mem.write_u32(thread.stack_end(mem), STACK_SENTINEL);

    if core == MAIN_CORE {
        scheduler::set_core_running_thread(k, core, thread);
    }

    scheduler::mark_thread_active_no_lock(k, thread);
}

pub(crate) const DEFAULT_THREAD_STACK_SIZE: u32 = 0x2000;

fn initialise_deallocator_thread(k: &Kernel, core: u32) {
    let mem = k.mem();
    let view = k.core(MAIN_CORE);
    let pc = &k.statics.thread[core as usize];

    list::init(mem, QueueRef(pc.dealloc_queue));
    list::init(mem, QueueRef(pc.dealloc_thread_queue));

    let thread = OsThread(pc.dealloc_thread);
    mem.write_cstr(pc.dealloc_name, 40, &format!("{{SYS Thread Terminator Core {core}}}"));

    view.create_thread(
        thread,
        k.builtins.deallocator_thread_entry,
        core,
        VirtAddr::NULL,
        VirtAddr(pc.dealloc_stack.0 + super::DEALLOCATOR_THREAD_STACK_SIZE),
        super::DEALLOCATOR_THREAD_STACK_SIZE,
        -1,
        ThreadAttributes::from_bits_retain(1 << core),
    );
    view.set_thread_name(thread, pc.dealloc_name);
    view.resume_thread(thread);
}

pub(crate) fn initialise_core_threads(k: &Kernel) {
    scheduler::lock(k, MAIN_CORE);
    for core in 0..CORE_COUNT {
        let view = k.core(MAIN_CORE);
        view.create_alarm(alarm::OsAlarm(k.statics.thread[core as usize].time_slice_alarm));
        initialise_default_thread(k, core);
    }
    scheduler::unlock(k, MAIN_CORE);
}

pub(crate) fn initialise_system_threads(k: &Kernel) {
    for core in 0..CORE_COUNT {
        initialise_deallocator_thread(k, core);
    }
}

/// Run the boot handshake that lets the secondary cores' default threads
/// initialise and rendezvous with the main core. Requires a live CPU.
pub(crate) fn boot_secondary_cores(k: &Kernel) {
    let mem = k.mem();
    let view = k.core(MAIN_CORE);
    mem.write_u32(k.statics.rendezvous_mask, 1 << MAIN_CORE);

    for core in [0u32, 2] {
        let thread = OsThread(k.statics.thread[core as usize].default_thread);
        view.init_rendezvous(sync::rendezvous::OsRendezvous(k.statics.rendezvous));

        scheduler::lock(k, MAIN_CORE);
        thread.set_state(mem, ThreadState::Ready);
        scheduler::resume_thread_no_lock(k, thread, 0);
        scheduler::reschedule_no_lock(&view, core);
        scheduler::unlock(k, MAIN_CORE);

        view.wait_rendezvous(sync::rendezvous::OsRendezvous(k.statics.rendezvous), 1 << core);
    }
}

#[cfg(test)]
mod tests;
