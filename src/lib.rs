/*
 * coreinit — guest-kernel emulation core
 *
 * High-level emulation of the Cafe OS kernel library for a three-core
 * PowerPC console. Guest code calls into this crate through the function
 * export table; this crate gives it a multicore RTOS: threads with
 * priority scheduling, mutexes / condition variables / fast mutexes /
 * semaphores / events / message queues / rendezvous, timed alarms with
 * per-core callback threads, a family of heap allocators, a locked-cache
 * scratchpad allocator and a handle table.
 *
 * Everything guest-visible lives in big-endian guest memory at fixed
 * offsets. The emulated cores are driven through the `Cpu` trait; a
 * single scheduler id-lock serializes every scheduler mutation, exactly
 * like the real kernel.
 */

#[macro_use]
pub mod guest;

pub mod alarm;
pub mod atomic64;
pub mod context;
pub mod coroutine;
pub mod cpu;
pub mod exception;
pub mod handle;
pub mod idlock;
pub mod interrupts;
pub mod lockedcache;
pub mod mem;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(test)]
pub(crate) mod testkit;

use core::sync::atomic::{AtomicU16, Ordering};

use guest::{GuestMemory, VirtAddr};
use idlock::IdLock;

pub use cpu::{Cpu, CORE_COUNT, MAIN_CORE};

/// Physical layout of the mapped guest regions.
///
/// Region addresses are fixed by the console's ABI; mapped sizes are
/// configurable so hosts (and tests) only commit the memory they need.
#[derive(Copy, Clone, Debug)]
pub struct MemoryLayout {
    /// Main application memory.
    pub mem2_start: u32,
    pub mem2_size: u32,
    /// The small fast memory bank.
    pub mem1_start: u32,
    pub mem1_size: u32,
    /// The foreground bucket.
    pub foreground_start: u32,
    pub foreground_size: u32,
    /// Kernel-internal carve at the head of MEM2 (static data, system heap).
    pub system_size: u32,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        MemoryLayout {
            mem2_start: 0x1000_0000,
            mem2_size: 0x0100_0000,
            mem1_start: 0xF400_0000,
            mem1_size: 0x0040_0000,
            foreground_start: 0xE000_0000,
            foreground_size: 0x0040_0000,
            system_size: 0x0010_0000,
        }
    }
}

/// Locked cache geometry: one 16 KiB scratchpad per core.
pub const LOCKED_CACHE_BASE: u32 = 0xE810_0000;
pub const LOCKED_CACHE_STRIDE: u32 = 0x1_0000;

const DEALLOCATOR_THREAD_STACK_SIZE: u32 = 0x2000;
const ALARM_THREAD_STACK_SIZE: u32 = 0x8000;
const BUILTIN_SLOTS: u32 = 64;

/// A host function exposed to the guest at a reserved address.
pub type BuiltinFn = fn(&Kernel, u32, [u32; 4]) -> u32;

pub(crate) struct PerCoreSched {
    pub run_queue: VirtAddr,
    pub current_thread: VirtAddr,
    pub enabled: VirtAddr,
    pub last_switch: VirtAddr,
    pub pause_time: VirtAddr,
}

pub(crate) struct PerCoreThread {
    pub default_thread: VirtAddr,
    pub default_name: VirtAddr,
    pub default_stack: VirtAddr,
    pub time_slice_alarm: VirtAddr,
    pub dealloc_queue: VirtAddr,
    pub dealloc_thread_queue: VirtAddr,
    pub dealloc_thread: VirtAddr,
    pub dealloc_stack: VirtAddr,
    pub dealloc_name: VirtAddr,
}

pub(crate) struct PerCoreAlarm {
    pub thread: VirtAddr,
    pub name: VirtAddr,
    pub stack: VirtAddr,
    pub alarm_queue: VirtAddr,
    pub callback_queue: VirtAddr,
    pub callback_thread_queue: VirtAddr,
}

pub(crate) struct MemHeapStatics {
    pub lock: VirtAddr,
    pub foreground_list: VirtAddr,
    pub mem1_list: VirtAddr,
    pub mem2_list: VirtAddr,
    pub arenas: VirtAddr,      // 3 heap handles
    pub fill_values: VirtAddr, // 3 u32
}

/// Addresses of kernel-internal data carved from the system area.
pub(crate) struct Statics {
    pub active_queue: VirtAddr,
    pub sched: [PerCoreSched; 3],
    pub thread: [PerCoreThread; 3],
    pub rendezvous: VirtAddr,
    pub rendezvous_mask: VirtAddr,
    pub alarm: [PerCoreAlarm; 3],
    pub interrupt_handlers: VirtAddr,
    pub exception_globals: VirtAddr,
    pub locked_cache: [VirtAddr; 3],
    pub memheap: MemHeapStatics,
    pub allocator_fns: VirtAddr, // 5 pairs of {alloc, free}
    pub builtin_base: VirtAddr,
    pub system_heap_base: VirtAddr,
    pub system_heap_size: u32,
}

/// Addresses of the builtin guest functions the kernel itself installs.
pub(crate) struct Builtins {
    pub thread_entry: VirtAddr,
    pub default_thread_entry: VirtAddr,
    pub deallocator_thread_entry: VirtAddr,
    pub alarm_thread_entry: VirtAddr,
    pub sleep_alarm_handler: VirtAddr,
    pub event_alarm_handler: VirtAddr,
    pub subtable_alloc: VirtAddr,
    pub subtable_free: VirtAddr,
}

/// Simple bump carver for the system area.
struct Carver {
    next: u32,
    end: u32,
}

impl Carver {
    fn take(&mut self, size: u32, align: u32) -> VirtAddr {
        let addr = (self.next + align - 1) & !(align - 1);
        assert!(addr + size <= self.end, "system area exhausted");
        self.next = addr + size;
        VirtAddr(addr)
    }
}

/// The kernel-emulation core. One instance per emulated process.
pub struct Kernel {
    mem: GuestMemory,
    cpu: Box<dyn Cpu>,
    layout: MemoryLayout,
    pub(crate) sched_lock: IdLock,
    pub(crate) alarm_lock: IdLock,
    pub(crate) atomic64_lock: IdLock,
    base_time: i64,
    next_thread_id: AtomicU16,
    pub(crate) statics: Statics,
    pub(crate) builtins: Builtins,
    builtin_table: spin::Mutex<Vec<Option<BuiltinFn>>>,
}

impl Kernel {
    /// Construct and initialise the kernel over a fresh guest arena.
    ///
    /// This performs every initialisation step that does not require live
    /// cores: static data, heap registry, system heap, default threads,
    /// deallocator and alarm-callback threads. The boot handshake that
    /// runs the secondary cores' default threads is `boot()`.
    pub fn new(layout: MemoryLayout, cpu: Box<dyn Cpu>) -> Kernel {
        let mut mem = GuestMemory::new();
        mem.map(layout.mem2_start, layout.mem2_size);
        mem.map(layout.mem1_start, layout.mem1_size);
        mem.map(layout.foreground_start, layout.foreground_size);
        for core in 0..CORE_COUNT {
            mem.map(LOCKED_CACHE_BASE + core * LOCKED_CACHE_STRIDE, lockedcache::LC_MAX_SIZE);
        }

        let mut c = Carver {
            next: layout.mem2_start,
            end: layout.mem2_start + layout.system_size,
        };

        let builtin_base = c.take(BUILTIN_SLOTS * 4, 4);

        let active_queue = c.take(0x10, 4);
        let sched = core::array::from_fn(|_| PerCoreSched {
            run_queue: c.take(0x10, 4),
            current_thread: c.take(4, 4),
            enabled: c.take(4, 4),
            last_switch: c.take(8, 8),
            pause_time: c.take(8, 8),
        });

        let thread = core::array::from_fn(|_| PerCoreThread {
            default_thread: c.take(thread::OsThread::SIZE, 8),
            default_name: c.take(32, 4),
            default_stack: c.take(thread::DEFAULT_THREAD_STACK_SIZE, 8),
            time_slice_alarm: c.take(alarm::OsAlarm::SIZE, 8),
            dealloc_queue: c.take(0x10, 4),
            dealloc_thread_queue: c.take(0x10, 4),
            dealloc_thread: c.take(thread::OsThread::SIZE, 8),
            dealloc_stack: c.take(DEALLOCATOR_THREAD_STACK_SIZE, 8),
            dealloc_name: c.take(40, 4),
        });
        let rendezvous = c.take(0x10, 4);
        let rendezvous_mask = c.take(4, 4);

        let alarm = core::array::from_fn(|_| PerCoreAlarm {
            thread: c.take(thread::OsThread::SIZE, 8),
            name: c.take(16, 4),
            stack: c.take(ALARM_THREAD_STACK_SIZE, 8),
            alarm_queue: c.take(alarm::OsAlarmQueue::SIZE, 4),
            callback_queue: c.take(alarm::OsAlarmQueue::SIZE, 4),
            callback_thread_queue: c.take(0x10, 4),
        });

        let interrupt_handlers = c.take(interrupts::INTERRUPT_TYPE_MAX * 4, 4);
        let exception_globals = c.take(5 * CORE_COUNT * 4, 4);
        let locked_cache = core::array::from_fn(|_| c.take(lockedcache::LC_STATE_SIZE, 8));

        let memheap = MemHeapStatics {
            lock: c.take(0x10, 4),
            foreground_list: c.take(mem::list::MemList::SIZE, 4),
            mem1_list: c.take(mem::list::MemList::SIZE, 4),
            mem2_list: c.take(mem::list::MemList::SIZE, 4),
            arenas: c.take(12, 4),
            fill_values: c.take(12, 4),
        };
        let allocator_fns = c.take(5 * 8, 4);

        let system_heap_base = c.take(0, 8);
        let system_heap_size = c.end - system_heap_base.0;

        let statics = Statics {
            active_queue,
            sched,
            thread,
            rendezvous,
            rendezvous_mask,
            alarm,
            interrupt_handlers,
            exception_globals,
            locked_cache,
            memheap,
            allocator_fns,
            builtin_base,
            system_heap_base,
            system_heap_size,
        };

        let base_time = cpu.time_base();

        let mut kernel = Kernel {
            mem,
            cpu,
            layout,
            sched_lock: IdLock::new(),
            alarm_lock: IdLock::new(),
            atomic64_lock: IdLock::new(),
            base_time,
            next_thread_id: AtomicU16::new(1),
            statics,
            builtins: Builtins {
                thread_entry: VirtAddr::NULL,
                default_thread_entry: VirtAddr::NULL,
                deallocator_thread_entry: VirtAddr::NULL,
                alarm_thread_entry: VirtAddr::NULL,
                sleep_alarm_handler: VirtAddr::NULL,
                event_alarm_handler: VirtAddr::NULL,
                subtable_alloc: VirtAddr::NULL,
                subtable_free: VirtAddr::NULL,
            },
            builtin_table: spin::Mutex::new(Vec::new()),
        };

        kernel.builtins = Builtins {
            thread_entry: kernel.register_builtin(thread::builtin_thread_entry),
            default_thread_entry: kernel.register_builtin(thread::builtin_default_thread_entry),
            deallocator_thread_entry: kernel.register_builtin(thread::builtin_deallocator_thread_entry),
            alarm_thread_entry: kernel.register_builtin(alarm::builtin_alarm_thread_entry),
            sleep_alarm_handler: kernel.register_builtin(thread::builtin_sleep_alarm_handler),
            event_alarm_handler: kernel.register_builtin(sync::event::builtin_event_alarm_handler),
            subtable_alloc: kernel.register_builtin(handle::builtin_subtable_alloc),
            subtable_free: kernel.register_builtin(handle::builtin_subtable_free),
        };

        kernel.initialise();
        kernel
    }

    fn initialise(&self) {
        scheduler::initialise(self);
        // The default threads must exist before anything takes a spinlock
        thread::initialise_core_threads(self);
        mem::initialise(self);
        mem::system_heap::initialise(self);
        mem::allocator::initialise(self);
        interrupts::initialise(self);
        for core in 0..CORE_COUNT {
            lockedcache::initialise(self, core);
        }
        thread::initialise_system_threads(self);
        alarm::initialise(self);
    }

    /// Run the secondary-core boot handshake: let the default threads of
    /// cores 0 and 2 run their initialisation and rendezvous with the main
    /// core. Requires a live `Cpu` able to run guest threads.
    pub fn boot(&self) {
        thread::boot_secondary_cores(self);
    }

    #[inline]
    pub fn mem(&self) -> &GuestMemory {
        &self.mem
    }

    #[inline]
    pub fn cpu(&self) -> &dyn Cpu {
        &*self.cpu
    }

    #[inline]
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[inline]
    pub fn base_time(&self) -> i64 {
        self.base_time
    }

    pub(crate) fn allocate_thread_id(&self) -> u16 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Expose a host function to the guest at a reserved address.
    pub fn register_builtin(&self, f: BuiltinFn) -> VirtAddr {
        let mut table = self.builtin_table.lock();
        let idx = table.len() as u32;
        assert!(idx < BUILTIN_SLOTS, "builtin window exhausted");
        table.push(Some(f));
        self.statics.builtin_base.offset(idx * 4)
    }

    pub(crate) fn is_builtin(&self, func: VirtAddr) -> bool {
        let base = self.statics.builtin_base.0;
        func.0 >= base && func.0 < base + BUILTIN_SLOTS * 4 && (func.0 - base) % 4 == 0
    }

    /// Invoke a guest function: builtins dispatch to host code, everything
    /// else goes to the CPU.
    pub fn invoke_guest(&self, core: u32, func: VirtAddr, args: [u32; 4]) -> u32 {
        debug_assert!(!func.is_null(), "invoking null guest function");
        if self.is_builtin(func) {
            let idx = (func.0 - self.statics.builtin_base.0) / 4;
            let f = self.builtin_table.lock()[idx as usize];
            match f {
                Some(f) => f(self, core, args),
                None => panic!("builtin slot {idx} not registered"),
            }
        } else {
            self.cpu.invoke(core, func, args)
        }
    }

    /// Per-core view; all guest-callable operations hang off this.
    #[inline]
    pub fn core(&self, id: u32) -> Core<'_> {
        assert!(id < CORE_COUNT, "bad core id {id}");
        Core { k: self, id }
    }

    /// Claim transient scratch space below the current thread's guest
    /// stack pointer for the duration of `f`.
    pub(crate) fn with_stack_alloc<R>(
        &self,
        core: u32,
        size: u32,
        f: impl FnOnce(VirtAddr) -> R,
    ) -> R {
        let t = scheduler::core_running_thread(self, core);
        assert!(!t.is_null(), "stack scratch without a running thread");
        let ctx = t.context();
        let old_sp = ctx.sp(&self.mem);
        let addr = VirtAddr(old_sp.0 - size).align_down(8);
        ctx.set_sp(&self.mem, addr);
        let r = f(addr);
        ctx.set_sp(&self.mem, old_sp);
        r
    }
}

/// A view of the kernel from one emulated core, standing in for "the core
/// this call is executing on".
#[derive(Copy, Clone)]
pub struct Core<'k> {
    pub(crate) k: &'k Kernel,
    pub(crate) id: u32,
}

impl<'k> Core<'k> {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn kernel(&self) -> &'k Kernel {
        self.k
    }

    #[inline]
    pub(crate) fn mem(&self) -> &'k GuestMemory {
        &self.k.mem
    }
}
