/*
 * Test Kit
 *
 * A recording CPU with a manual clock, plus staging helpers that put the
 * kernel into a chosen scheduling state without running guest code.
 *
 * The recording CPU never transfers control: a context switch is logged
 * and returns immediately. Tests therefore stage "the current thread" by
 * hand and assert on the resulting guest state.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use crate::cpu::{Cpu, CORE_COUNT};
use crate::guest::list::{self, QueueRef};
use crate::guest::VirtAddr;
use crate::scheduler;
use crate::thread::{OsThread, ThreadAttributes, ThreadQueue, ThreadState, THREAD_LINK};
use crate::{Core, Kernel, MemoryLayout};

type GuestFn = Box<dyn FnMut(u32, [u32; 4]) -> u32 + Send>;

pub(crate) struct TestCpu {
    now: AtomicI64,
    /// Ticks added every `check_interrupts`, so busy-wait loops make
    /// progress against the manual clock.
    pub auto_advance: AtomicI64,
    interrupts_enabled: [AtomicBool; 3],
    pub switches: spin::Mutex<Vec<(u32, Option<VirtAddr>, Option<VirtAddr>)>>,
    pub icis: spin::Mutex<Vec<u32>>,
    pub next_alarms: spin::Mutex<[Option<i64>; 3]>,
    funcs: spin::Mutex<HashMap<u32, GuestFn>>,
    next_fn: AtomicU32,
}

/// Start the clock well past zero so "ticks since epoch" arithmetic has
/// room to move in both directions.
const START_TIME: i64 = 1_000_000_000;

impl TestCpu {
    pub fn new() -> TestCpu {
        TestCpu {
            now: AtomicI64::new(START_TIME),
            auto_advance: AtomicI64::new(0),
            interrupts_enabled: [AtomicBool::new(true), AtomicBool::new(true), AtomicBool::new(true)],
            switches: spin::Mutex::new(Vec::new()),
            icis: spin::Mutex::new(Vec::new()),
            next_alarms: spin::Mutex::new([None; 3]),
            funcs: spin::Mutex::new(HashMap::new()),
            next_fn: AtomicU32::new(0x0200_0000),
        }
    }

    pub fn advance(&self, ticks: i64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set_time(&self, ticks: i64) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    /// Register a host closure as a callable guest function.
    pub fn register_fn(&self, f: impl FnMut(u32, [u32; 4]) -> u32 + Send + 'static) -> VirtAddr {
        let addr = self.next_fn.fetch_add(4, Ordering::SeqCst);
        self.funcs.lock().insert(addr, Box::new(f));
        VirtAddr(addr)
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().len()
    }

    pub fn last_switch(&self) -> Option<(u32, Option<VirtAddr>, Option<VirtAddr>)> {
        self.switches.lock().last().copied()
    }
}

impl Cpu for Arc<TestCpu> {
    fn switch_context(&self, core: u32, from: Option<VirtAddr>, to: Option<VirtAddr>) {
        self.switches.lock().push((core, from, to));
    }

    fn invoke(&self, core: u32, func: VirtAddr, args: [u32; 4]) -> u32 {
        // Take the closure out so it can re-enter the kernel (and this
        // table) without deadlocking.
        let f = self.funcs.lock().remove(&func.0);
        match f {
            Some(mut f) => {
                let result = f(core, args);
                self.funcs.lock().insert(func.0, f);
                result
            }
            None => {
                log::debug!("test cpu: invoke of unregistered function {func}");
                0
            }
        }
    }

    fn interrupt(&self, core: u32) {
        self.icis.lock().push(core);
    }

    fn set_interrupts_enabled(&self, core: u32, enabled: bool) -> bool {
        self.interrupts_enabled[core as usize].swap(enabled, Ordering::SeqCst)
    }

    fn interrupts_enabled(&self, core: u32) -> bool {
        self.interrupts_enabled[core as usize].load(Ordering::SeqCst)
    }

    fn check_interrupts(&self, _core: u32) {
        let bump = self.auto_advance.load(Ordering::SeqCst);
        if bump != 0 {
            self.advance(bump);
        }
    }

    fn set_next_alarm(&self, core: u32, at: Option<i64>) {
        self.next_alarms.lock()[core as usize] = at;
    }

    fn time_base(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) struct TestKernel {
    pub k: Kernel,
    pub cpu: Arc<TestCpu>,
    bump: AtomicU32,
}

impl TestKernel {
    pub fn new() -> TestKernel {
        let layout = MemoryLayout {
            mem2_size: 0x0040_0000,
            mem1_size: 0x0010_0000,
            foreground_size: 0x0010_0000,
            system_size: 0x0008_0000,
            ..MemoryLayout::default()
        };
        TestKernel::with_layout(layout)
    }

    pub fn with_layout(layout: MemoryLayout) -> TestKernel {
        let cpu = Arc::new(TestCpu::new());
        let k = Kernel::new(layout, Box::new(cpu.clone()));
        let t = TestKernel {
            bump: AtomicU32::new(layout.mem2_start + layout.system_size),
            k,
            cpu,
        };
        t.park_system_threads();
        t.make_current(crate::MAIN_CORE, t.default_thread(crate::MAIN_CORE));
        t.cpu.switches.lock().clear();
        t.cpu.icis.lock().clear();
        t
    }

    /// Bump-allocate scratch guest memory in MEM2.
    pub fn alloc(&self, size: u32, align: u32) -> VirtAddr {
        let mut addr;
        loop {
            let cur = self.bump.load(Ordering::SeqCst);
            addr = (cur + align - 1) & !(align - 1);
            let end = self.k.layout().mem2_start + self.k.layout().mem2_size;
            assert!(addr + size <= end, "test arena exhausted");
            if self
                .bump
                .compare_exchange(cur, addr + size, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        VirtAddr(addr)
    }

    pub fn alloc_queue(&self, core: &Core<'_>) -> ThreadQueue {
        let q = ThreadQueue(self.alloc(ThreadQueue::SIZE, 4));
        core.init_thread_queue(q);
        q
    }

    pub fn default_thread(&self, core: u32) -> OsThread {
        OsThread(self.k.statics.thread[core as usize].default_thread)
    }

    /// Create and resume a thread with a dummy entry point. The thread
    /// lands in the ready queues of the cores in `affinity`.
    pub fn spawn_thread(&self, core: &Core<'_>, priority: i32, affinity: u8) -> OsThread {
        let thread = OsThread(self.alloc(OsThread::SIZE, 8));
        let stack_size = 0x2000;
        let stack = self.alloc(stack_size, 8);
        let entry = self.cpu.register_fn(|_, _| 0);

        core.create_thread(
            thread,
            entry,
            0,
            VirtAddr::NULL,
            VirtAddr(stack.0 + stack_size),
            stack_size,
            priority,
            ThreadAttributes::from_bits_retain(affinity),
        );
        core.resume_thread(thread);
        thread
    }

    /// Force `thread` to be the running thread on `core`, re-queueing
    /// whatever ran there before.
    pub fn make_current(&self, core: u32, thread: OsThread) {
        let k = &self.k;
        let mem = k.mem();
        scheduler::lock(k, core);

        let current = scheduler::core_running_thread(k, core);
        if current != thread {
            if !current.is_null() && current.state(mem) == ThreadState::Running {
                current.set_state(mem, ThreadState::Ready);
                scheduler::queue_thread_no_lock(k, current);
            }

            scheduler::unqueue_thread_no_lock(k, thread);
            thread.set_state(mem, ThreadState::Running);
            scheduler::set_core_running_thread(k, core, thread);
        }

        scheduler::unlock(k, core);
    }

    /// Move the per-core system threads into their steady state: asleep
    /// on their wait queues, as they would be after their first run.
    fn park_system_threads(&self) {
        let k = &self.k;
        for core in 0..CORE_COUNT {
            let ts = &k.statics.thread[core as usize];
            let al = &k.statics.alarm[core as usize];
            self.park(OsThread(ts.dealloc_thread), ts.dealloc_thread_queue);
            self.park(OsThread(al.thread), al.callback_thread_queue);
        }
    }

    fn park(&self, thread: OsThread, queue: VirtAddr) {
        let k = &self.k;
        let mem = k.mem();
        scheduler::lock(k, crate::MAIN_CORE);

        scheduler::unqueue_thread_no_lock(k, thread);
        for core in 0..CORE_COUNT {
            if scheduler::core_running_thread(k, core) == thread {
                scheduler::set_core_running_thread(k, core, OsThread::NULL);
            }
        }
        thread.set_state(mem, ThreadState::Waiting);
        thread.set_queue(mem, queue);
        list::insert_sorted(mem, QueueRef(queue), thread.addr(), THREAD_LINK, scheduler::thread_is_less);

        scheduler::unlock(k, crate::MAIN_CORE);
    }

    /// Threads queued on `queue`, head first.
    pub fn queue_members(&self, queue: VirtAddr) -> Vec<OsThread> {
        let mem = self.k.mem();
        let mut out = Vec::new();
        let mut it = QueueRef(queue).head(mem);
        while !it.is_null() {
            out.push(OsThread(it));
            it = list::next(mem, it, THREAD_LINK);
        }
        out
    }

    /// Alarms in an alarm queue, head first.
    pub fn queue_members_alarm(&self, queue: VirtAddr) -> Vec<crate::alarm::OsAlarm> {
        let mem = self.k.mem();
        let mut out = Vec::new();
        // The alarm list head/tail pair sits past the queue header
        let mut it = QueueRef(queue.offset(0x1C)).head(mem);
        while !it.is_null() {
            out.push(crate::alarm::OsAlarm(it));
            it = list::next(mem, it, crate::alarm::ALARM_LINK);
        }
        out
    }

    /// Threads in a core's ready queue, head first.
    pub fn ready_queue(&self, core: u32) -> Vec<OsThread> {
        let mem = self.k.mem();
        let q = QueueRef(self.k.statics.sched[core as usize].run_queue);
        let mut out = Vec::new();
        let mut it = q.head(mem);
        while !it.is_null() {
            out.push(OsThread(it));
            it = list::next(mem, it, crate::thread::CORE_RUN_LINKS[core as usize]);
        }
        out
    }
}
