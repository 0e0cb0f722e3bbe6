/*
 * Event
 *
 * A boolean flag threads can wait on. AutoReset hands the signal to
 * exactly one waiter and clears the flag; ManualReset leaves the flag set
 * until `reset_event`. A waiter with a timeout arms a one-shot system
 * alarm whose handler wakes it and marks the wait as timed out; signalling
 * a waiter first requires cancelling that alarm.
 */

use crate::alarm::{self, OsAlarm};
use crate::guest::VirtAddr;
use crate::scheduler;
use crate::thread::{OsThread, ThreadQueue};
use crate::time;
use crate::{Core, Kernel};

pub const EVENT_TAG: u32 = 0x6556_6E54; // "eVnT"

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum EventMode {
    AutoReset = 0,
    ManualReset = 1,
}

guest_struct! {
    pub struct OsEvent : 0x24 {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => value, set_value: u32;
        0x10 => queue: struct ThreadQueue;
        0x20 => mode_raw, set_mode_raw: u32;
    }
}

impl OsEvent {
    pub fn mode(self, mem: &crate::guest::GuestMemory) -> EventMode {
        if self.mode_raw(mem) == EventMode::ManualReset as u32 {
            EventMode::ManualReset
        } else {
            EventMode::AutoReset
        }
    }
}

/// Timeout bookkeeping shared between the waiter and the alarm handler,
/// kept in the waiter's stack scratch.
guest_struct! {
    pub struct EventAlarmData : 0x0C {
        0x00 => event, set_event: addr;
        0x04 => thread, set_thread: addr;
        0x08 => timed_out, set_timed_out: u32;
    }
}

impl<'k> Core<'k> {
    pub fn init_event(&self, event: OsEvent, value: bool, mode: EventMode) {
        self.init_event_ex(event, value, mode, VirtAddr::NULL)
    }

    pub fn init_event_ex(&self, event: OsEvent, value: bool, mode: EventMode, name: VirtAddr) {
        let mem = self.mem();
        event.set_tag(mem, EVENT_TAG);
        event.set_mode_raw(mem, mode as u32);
        event.set_value(mem, value as u32);
        event.set_name(mem, name);
        crate::thread::init_thread_queue_ex(mem, event.queue(), event.addr());
    }

    /// Signal the event. AutoReset wakes the first signalable waiter and
    /// keeps the value clear; ManualReset wakes them all and latches the
    /// value.
    pub fn signal_event(&self, event: OsEvent) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(event.tag(mem) == EVENT_TAG);

        if event.value(mem) != 0 {
            // Already signalled
            scheduler::unlock(k, self.id);
            return;
        }

        event.set_value(mem, 1);

        if event.mode(mem) == EventMode::AutoReset {
            if !event.queue().head(mem).is_null() {
                // Find the first waiter whose timeout can still be called off
                let mut wake = OsThread::NULL;
                let mut it = event.queue().head(mem);
                while !it.is_null() {
                    let thread = OsThread(it);
                    debug_assert!(thread.queue(mem) == event.queue().addr());

                    if signalable(k, thread) {
                        wake = thread;
                        break;
                    }
                    it = crate::guest::list::next(mem, it, crate::thread::THREAD_LINK);
                }

                if !wake.is_null() {
                    event.set_value(mem, 0);
                    scheduler::wakeup_one_thread_no_lock(k, wake);
                }

                scheduler::reschedule_all_cores_no_lock(self);
            }
        } else {
            let mut it = event.queue().head(mem);
            while !it.is_null() {
                let thread = OsThread(it);
                debug_assert!(thread.queue(mem) == event.queue().addr());
                let next = crate::guest::list::next(mem, it, crate::thread::THREAD_LINK);

                if signalable(k, thread) {
                    scheduler::wakeup_one_thread_no_lock(k, thread);
                }
                it = next;
            }

            scheduler::reschedule_all_cores_no_lock(self);
        }

        scheduler::unlock(k, self.id);
    }

    /// Signal and wake every waiter. AutoReset only latches the value if
    /// nothing was woken.
    pub fn signal_event_all(&self, event: OsEvent) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(event.tag(mem) == EVENT_TAG);

        if event.value(mem) != 0 {
            scheduler::unlock(k, self.id);
            return;
        }

        if event.mode(mem) == EventMode::ManualReset {
            event.set_value(mem, 1);
        }

        if !event.queue().head(mem).is_null() {
            let mut woken = 0u32;
            let mut it = event.queue().head(mem);
            while !it.is_null() {
                let thread = OsThread(it);
                let next = crate::guest::list::next(mem, it, crate::thread::THREAD_LINK);

                if signalable(k, thread) {
                    scheduler::wakeup_one_thread_no_lock(k, thread);
                    woken += 1;
                }
                it = next;
            }

            if event.mode(mem) == EventMode::AutoReset && woken == 0 {
                event.set_value(mem, 1);
            }

            scheduler::reschedule_all_cores_no_lock(self);
        }

        scheduler::unlock(k, self.id);
    }

    pub fn reset_event(&self, event: OsEvent) {
        let k = self.k;
        scheduler::lock(k, self.id);
        debug_assert!(event.tag(self.mem()) == EVENT_TAG);
        event.set_value(self.mem(), 0);
        scheduler::unlock(k, self.id);
    }

    /// Wait for the event to become signalled.
    pub fn wait_event(&self, event: OsEvent) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);

        // Some games wait on events they never initialised
        if event.tag(mem) != EVENT_TAG {
            self.init_event(event, false, EventMode::ManualReset);
        }

        if event.value(mem) != 0 {
            if event.mode(mem) == EventMode::AutoReset {
                event.set_value(mem, 0);
            }
        } else {
            scheduler::sleep_thread_no_lock(self, event.queue().addr());
            scheduler::reschedule_self_no_lock(self);
        }

        scheduler::unlock(k, self.id);
    }

    /// Wait with a timeout in nanoseconds. Returns false on timeout.
    pub fn wait_event_with_timeout(&self, event: OsEvent, timeout_ns: i64) -> bool {
        let k = self.k;
        let mem = self.mem();

        self.k.with_stack_alloc(self.id, EventAlarmData::SIZE + 4 + OsAlarm::SIZE, |scratch| {
            let data = EventAlarmData(scratch);
            let a = OsAlarm(scratch.offset(EventAlarmData::SIZE + 4));

            scheduler::lock(k, self.id);

            if event.value(mem) != 0 {
                if event.mode(mem) == EventMode::AutoReset {
                    event.set_value(mem, 0);
                }
                scheduler::unlock(k, self.id);
                return true;
            }

            let thread = self.current_thread();
            data.set_event(mem, event.addr());
            data.set_thread(mem, thread.addr());
            data.set_timed_out(mem, 0);

            self.create_alarm(a);
            alarm::set_alarm_internal(
                self,
                a,
                time::ns_to_ticks(timeout_ns),
                k.builtins.event_alarm_handler,
                data.addr(),
            );
            thread.set_wait_event_timeout_alarm(mem, a.addr());

            scheduler::sleep_thread_no_lock(self, event.queue().addr());
            scheduler::reschedule_all_cores_no_lock(self);

            thread.set_wait_event_timeout_alarm(mem, VirtAddr::NULL);

            let mut result = false;
            if event.value(mem) != 0 {
                if event.mode(mem) == EventMode::AutoReset {
                    event.set_value(mem, 0);
                }
                result = true;
            } else if data.timed_out(mem) == 0 {
                result = true;
            }

            scheduler::unlock(k, self.id);
            result
        })
    }
}

/// Whether a waiter can be woken by a signal: either it has no timeout
/// alarm, or the alarm can still be cancelled.
fn signalable(k: &Kernel, thread: OsThread) -> bool {
    let alarm_addr = thread.wait_event_timeout_alarm(k.mem());
    if alarm_addr.is_null() {
        return true;
    }
    alarm::cancel_alarm_internal(k, OsAlarm(alarm_addr))
}

pub(crate) fn builtin_event_alarm_handler(k: &Kernel, _core: u32, args: [u32; 4]) -> u32 {
    // System alarm: the scheduler lock is already held
    let mem = k.mem();
    let a = OsAlarm(VirtAddr(args[0]));
    let data = EventAlarmData(a.user_data(mem));
    data.set_timed_out(mem, 1);

    let thread = OsThread(data.thread(mem));
    thread.set_wait_event_timeout_alarm(mem, VirtAddr::NULL);
    scheduler::wakeup_one_thread_no_lock(k, thread);
    0
}
