/*
 * Exception Callbacks
 *
 * Per-thread exception callbacks, one slot per core, for the five
 * exception types guest code may hook. A parallel global table exists,
 * but its lookup never produces a callback (the console's lookup falls
 * through to the "unsupported" path for every global mode); we reproduce
 * that behaviour and pin it with tests.
 */

use crate::guest::{GuestMemory, VirtAddr};
use crate::thread::OsThread;
use crate::Core;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExceptionType {
    Dsi,
    Isi,
    Program,
    Alignment,
    PerformanceMonitor,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExceptionMode {
    Thread,
    ThreadAllCores,
    Global,
    GlobalAllCores,
    System,
}

// Offsets of the per-core callback arrays inside OSThread.
const OFF_DSI: u32 = 0x630;
const OFF_ISI: u32 = 0x63C;
const OFF_PROGRAM: u32 = 0x648;
const OFF_PERF_MON: u32 = 0x654;
const OFF_ALIGN: u32 = 0x680;

fn slot_offset(kind: ExceptionType) -> u32 {
    match kind {
        ExceptionType::Dsi => OFF_DSI,
        ExceptionType::Isi => OFF_ISI,
        ExceptionType::Program => OFF_PROGRAM,
        ExceptionType::Alignment => OFF_ALIGN,
        ExceptionType::PerformanceMonitor => OFF_PERF_MON,
    }
}

pub(crate) fn thread_callback(
    mem: &GuestMemory,
    thread: OsThread,
    kind: ExceptionType,
    core: u32,
) -> VirtAddr {
    mem.read_addr(thread.addr().offset(slot_offset(kind) + core * 4))
}

pub(crate) fn set_thread_callback(
    mem: &GuestMemory,
    thread: OsThread,
    kind: ExceptionType,
    core: u32,
    callback: VirtAddr,
) {
    mem.write_addr(thread.addr().offset(slot_offset(kind) + core * 4), callback)
}

/// Copy every exception callback slot from one thread to another, as
/// thread creation inherits the creator's handlers.
pub(crate) fn copy_thread_callbacks(mem: &GuestMemory, from: OsThread, to: OsThread) {
    for kind in [
        ExceptionType::Dsi,
        ExceptionType::Isi,
        ExceptionType::Program,
        ExceptionType::Alignment,
        ExceptionType::PerformanceMonitor,
    ] {
        for core in 0..crate::CORE_COUNT {
            set_thread_callback(mem, to, kind, core, thread_callback(mem, from, kind, core));
        }
    }
}

impl<'k> Core<'k> {
    /// Install an exception callback for the current thread on this core,
    /// returning the previous one.
    pub fn set_exception_callback(&self, kind: ExceptionType, callback: VirtAddr) -> VirtAddr {
        self.set_exception_callback_ex(ExceptionMode::Thread, kind, callback)
    }

    pub fn set_exception_callback_ex(
        &self,
        mode: ExceptionMode,
        kind: ExceptionType,
        callback: VirtAddr,
    ) -> VirtAddr {
        let interrupts = self.disable_interrupts();
        let previous = self.exception_callback(mode, kind);
        self.install_exception_callback(mode, kind, callback);
        self.restore_interrupts(interrupts);
        previous
    }

    /// Look up the callback the given mode would dispatch.
    pub fn exception_callback(&self, mode: ExceptionMode, kind: ExceptionType) -> VirtAddr {
        let mem = self.mem();
        let thread = self.current_thread();

        if matches!(
            mode,
            ExceptionMode::Thread | ExceptionMode::ThreadAllCores | ExceptionMode::System
        ) {
            let callback = thread_callback(mem, thread, kind, self.id);
            if !callback.is_null() || mode != ExceptionMode::System {
                return callback;
            }
        }

        if matches!(
            mode,
            ExceptionMode::Global | ExceptionMode::GlobalAllCores | ExceptionMode::System
        ) {
            // The global lookup never yields a callback.
            return VirtAddr::NULL;
        }

        VirtAddr::NULL
    }

    fn install_exception_callback(
        &self,
        mode: ExceptionMode,
        kind: ExceptionType,
        callback: VirtAddr,
    ) {
        let mem = self.mem();
        let thread = self.current_thread();

        match mode {
            ExceptionMode::Thread => {
                set_thread_callback(mem, thread, kind, self.id, callback);
            }
            ExceptionMode::ThreadAllCores => {
                for core in 0..crate::CORE_COUNT {
                    set_thread_callback(mem, thread, kind, core, callback);
                }
            }
            ExceptionMode::Global => {
                let slot = global_slot(self.k, kind, self.id);
                mem.write_addr(slot, callback);
            }
            ExceptionMode::GlobalAllCores => {
                for core in 0..crate::CORE_COUNT {
                    mem.write_addr(global_slot(self.k, kind, core), callback);
                }
            }
            ExceptionMode::System => {}
        }
    }
}

fn global_slot(k: &crate::Kernel, kind: ExceptionType, core: u32) -> VirtAddr {
    // The global table reuses the interrupt handler static block's tail
    let index = match kind {
        ExceptionType::Dsi => 0,
        ExceptionType::Isi => 1,
        ExceptionType::Program => 2,
        ExceptionType::Alignment => 3,
        ExceptionType::PerformanceMonitor => 4,
    };
    k.statics.exception_globals.offset((index * crate::CORE_COUNT + core) * 4)
}
