/*
 * Alarms
 *
 * One-shot and periodic timers. Each core keeps an armed queue (alarms
 * waiting to fire) and a callback queue (fired alarms waiting for their
 * user callback), drained by a dedicated alarm-callback thread pinned to
 * that core. Alarms in the system group fire inline from the interrupt
 * handler instead.
 *
 * All alarm state is guarded by the alarm id-lock; paths that also touch
 * the scheduler take the scheduler lock first.
 */

use crate::context::OsContext;
use crate::cpu::{CORE_COUNT, MAIN_CORE};
use crate::guest::list::{self, Link, QueueRef};
use crate::guest::VirtAddr;
use crate::idlock;
use crate::scheduler;
use crate::thread::{OsThread, ThreadAttributes, ThreadQueue};
use crate::time::OsTime;
use crate::{Core, Kernel};

pub const ALARM_TAG: u32 = 0x614C_724D; // "aLrM"
pub const ALARM_QUEUE_TAG: u32 = 0x614C_6D51; // "aLmQ"

/// Alarms in this group are system-internal: their callback runs inline
/// from the alarm interrupt with the scheduler lock held.
pub const SYSTEM_ALARM_GROUP: u32 = 0xFFFF_FFFF;

/// Alarm lock id used by group cancellation, which owns no single alarm.
const GROUP_CANCEL_LOCK_ID: u32 = 0xFFFF_FFFE;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum AlarmState {
    Idle = 0,
    Set = 1,
    Expired = 2,
    Invalid = 3,
}

impl AlarmState {
    fn from_u32(v: u32) -> AlarmState {
        match v {
            1 => AlarmState::Set,
            2 => AlarmState::Expired,
            3 => AlarmState::Invalid,
            _ => AlarmState::Idle,
        }
    }
}

guest_struct! {
    pub struct OsAlarmQueue : 0x24 {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => thread_queue: struct ThreadQueue;
        0x1C => head, set_head: addr;
        0x20 => tail, set_tail: addr;
    }
}

guest_struct! {
    pub struct OsAlarm : 0x58 {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => callback, set_callback: addr;
        0x10 => group, set_group: u32;
        0x18 => next_fire, set_next_fire: i64;
        0x28 => period, set_period: i64;
        0x30 => tbr_start, set_tbr_start: i64;
        0x38 => user_data, set_user_data: addr;
        0x3C => state_raw, set_state_raw: u32;
        0x40 => thread_queue: struct ThreadQueue;
        0x50 => alarm_queue, set_alarm_queue: addr;
        0x54 => context, set_context: addr;
    }
}

impl OsAlarm {
    pub fn state(self, mem: &crate::guest::GuestMemory) -> AlarmState {
        AlarmState::from_u32(self.state_raw(mem))
    }

    pub fn set_state(self, mem: &crate::guest::GuestMemory, s: AlarmState) {
        self.set_state_raw(mem, s as u32)
    }
}

/// Link of an alarm inside an alarm queue. Note: prev before next.
pub(crate) const ALARM_LINK: Link = Link { next: 0x24, prev: 0x20 };

/// An OsAlarmQueue's head/tail pair sits at +0x1C.
fn alarm_list(queue: VirtAddr) -> QueueRef {
    QueueRef(queue.offset(0x1C))
}

fn acquire_alarm_lock_obj(k: &Kernel, alarm: OsAlarm) {
    k.alarm_lock.acquire(idlock::object_lock_id(alarm.addr()));
}

fn release_alarm_lock_obj(k: &Kernel, alarm: OsAlarm) {
    k.alarm_lock.release(idlock::object_lock_id(alarm.addr()));
}

impl<'k> Core<'k> {
    pub fn create_alarm(&self, alarm: OsAlarm) {
        self.create_alarm_ex(alarm, VirtAddr::NULL)
    }

    /// Initialise an alarm. Valid on an already-used alarm as long as it
    /// is not currently set.
    pub fn create_alarm_ex(&self, alarm: OsAlarm, name: VirtAddr) {
        let k = self.k;
        let mem = self.mem();
        acquire_alarm_lock_obj(k, alarm);

        mem.fill(alarm.addr(), OsAlarm::SIZE, 0);
        alarm.set_tag(mem, ALARM_TAG);
        alarm.set_name(mem, name);
        crate::thread::init_thread_queue_ex(mem, alarm.thread_queue(), alarm.addr());

        release_alarm_lock_obj(k, alarm);
    }

    pub fn init_alarm_queue(&self, queue: OsAlarmQueue) {
        self.init_alarm_queue_ex(queue, VirtAddr::NULL)
    }

    pub fn init_alarm_queue_ex(&self, queue: OsAlarmQueue, name: VirtAddr) {
        let mem = self.mem();
        mem.fill(queue.addr(), OsAlarmQueue::SIZE, 0);
        queue.set_tag(mem, ALARM_QUEUE_TAG);
        queue.set_name(mem, name);
    }

    /// Arm a one-shot alarm `delay` ticks from now.
    pub fn set_alarm(&self, alarm: OsAlarm, delay: OsTime, callback: VirtAddr) -> bool {
        self.set_periodic_alarm(alarm, self.k.time() + delay, 0, callback)
    }

    /// Arm an alarm to first fire at the absolute time `start`, then every
    /// `interval` ticks (0 for one-shot).
    pub fn set_periodic_alarm(
        &self,
        alarm: OsAlarm,
        start: OsTime,
        interval: OsTime,
        callback: VirtAddr,
    ) -> bool {
        let k = self.k;
        let mem = self.mem();
        acquire_alarm_lock_obj(k, alarm);

        alarm.set_next_fire(mem, start);
        alarm.set_callback(mem, callback);
        alarm.set_period(mem, interval);
        alarm.set_context(mem, VirtAddr::NULL);
        alarm.set_state(mem, AlarmState::Set);

        // Move from whatever queue it was on to this core's armed queue
        let old_queue = alarm.alarm_queue(mem);
        if !old_queue.is_null() {
            list::erase(mem, alarm_list(old_queue), alarm.addr(), ALARM_LINK);
            alarm.set_alarm_queue(mem, VirtAddr::NULL);
        }

        let queue = k.statics.alarm[self.id as usize].alarm_queue;
        alarm.set_alarm_queue(mem, queue);
        list::append(mem, alarm_list(queue), alarm.addr(), ALARM_LINK);

        update_cpu_alarm_no_lock(k, self.id);

        release_alarm_lock_obj(k, alarm);
        true
    }

    pub fn set_alarm_tag(&self, alarm: OsAlarm, group: u32) {
        let k = self.k;
        acquire_alarm_lock_obj(k, alarm);
        alarm.set_group(self.mem(), group);
        release_alarm_lock_obj(k, alarm);
    }

    pub fn set_alarm_user_data(&self, alarm: OsAlarm, data: VirtAddr) {
        let k = self.k;
        acquire_alarm_lock_obj(k, alarm);
        alarm.set_user_data(self.mem(), data);
        release_alarm_lock_obj(k, alarm);
    }

    pub fn alarm_user_data(&self, alarm: OsAlarm) -> VirtAddr {
        alarm.user_data(self.mem())
    }

    /// Cancel a set alarm, waking (as cancelled) everything in its wait
    /// queue. False if the alarm was not set.
    pub fn cancel_alarm(&self, alarm: OsAlarm) -> bool {
        let k = self.k;
        let mem = self.mem();

        acquire_alarm_lock_obj(k, alarm);
        let result = cancel_alarm_no_alarm_lock(k, alarm);
        release_alarm_lock_obj(k, alarm);

        if !result {
            return false;
        }

        scheduler::lock(k, self.id);

        let mut it = alarm.thread_queue().head(mem);
        while !it.is_null() {
            OsThread(it).set_alarm_cancelled(mem, 1);
            it = list::next(mem, it, crate::thread::THREAD_LINK);
        }

        scheduler::wakeup_thread_no_lock(k, alarm.thread_queue().addr());
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
        true
    }

    /// Cancel every armed alarm whose group tag matches.
    pub fn cancel_alarms(&self, group: u32) {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        k.alarm_lock.acquire(GROUP_CANCEL_LOCK_ID);

        for core in 0..CORE_COUNT {
            let queue = k.statics.alarm[core as usize].alarm_queue;
            let mut it = alarm_list(queue).head(mem);
            while !it.is_null() {
                let next = list::next(mem, it, ALARM_LINK);
                let alarm = OsAlarm(it);

                if alarm.group(mem) == group && cancel_alarm_no_alarm_lock(k, alarm) {
                    let mut waiter = alarm.thread_queue().head(mem);
                    while !waiter.is_null() {
                        OsThread(waiter).set_alarm_cancelled(mem, 1);
                        waiter = list::next(mem, waiter, crate::thread::THREAD_LINK);
                    }
                    scheduler::wakeup_thread_no_lock(k, alarm.thread_queue().addr());
                }

                it = next;
            }
        }

        k.alarm_lock.release(GROUP_CANCEL_LOCK_ID);
        scheduler::reschedule_all_cores_no_lock(self);
        scheduler::unlock(k, self.id);
    }

    /// Sleep until the alarm fires or is cancelled. True if it fired.
    pub fn wait_alarm(&self, alarm: OsAlarm) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        acquire_alarm_lock_obj(k, alarm);

        debug_assert!(alarm.tag(mem) == ALARM_TAG);

        if alarm.state(mem) != AlarmState::Set {
            release_alarm_lock_obj(k, alarm);
            scheduler::unlock(k, self.id);
            return false;
        }

        self.current_thread().set_alarm_cancelled(mem, 0);
        scheduler::sleep_thread_no_lock(self, alarm.thread_queue().addr());

        release_alarm_lock_obj(k, alarm);
        scheduler::reschedule_self_no_lock(self);

        let cancelled = self.current_thread().alarm_cancelled(mem) != 0;
        scheduler::unlock(k, self.id);
        !cancelled
    }

    /// Expire every due alarm on this core. Called by the host when the
    /// programmed alarm interrupt fires; `context` is the interrupted
    /// register context.
    pub fn handle_alarm_interrupt(&self, context: OsContext) {
        let k = self.k;
        let mem = self.mem();
        let pc = &k.statics.alarm[self.id as usize];
        let queue = pc.alarm_queue;
        let cb_queue = pc.callback_queue;

        let now = k.time();

        scheduler::lock(k, self.id);
        k.alarm_lock.acquire(idlock::core_lock_id(self.id));

        let mut it = alarm_list(queue).head(mem);
        while !it.is_null() {
            let next = list::next(mem, it, ALARM_LINK);
            let alarm = OsAlarm(it);

            if alarm.next_fire(mem) <= now {
                debug_assert!(alarm.state(mem) == AlarmState::Set);

                list::erase(mem, alarm_list(queue), alarm.addr(), ALARM_LINK);
                alarm.set_alarm_queue(mem, VirtAddr::NULL);
                alarm.set_state(mem, AlarmState::Expired);
                alarm.set_context(mem, context.addr());

                if !alarm.thread_queue().head(mem).is_null() {
                    scheduler::wakeup_thread_no_lock(k, alarm.thread_queue().addr());
                    scheduler::reschedule_other_cores_no_lock(self);
                }

                if alarm.group(mem) == SYSTEM_ALARM_GROUP {
                    let callback = alarm.callback(mem);
                    if !callback.is_null() {
                        let enabled = self.disable_interrupts();
                        k.invoke_guest(self.id, callback, [alarm.addr().0, context.addr().0, 0, 0]);
                        self.restore_interrupts(enabled);
                    }
                } else {
                    list::append(mem, alarm_list(cb_queue), alarm.addr(), ALARM_LINK);
                    alarm.set_alarm_queue(mem, cb_queue);
                    scheduler::wakeup_thread_no_lock(k, pc.callback_thread_queue);
                }
            }

            it = next;
        }

        update_cpu_alarm_no_lock(k, self.id);

        k.alarm_lock.release(idlock::core_lock_id(self.id));
        scheduler::unlock(k, self.id);
    }
}

/// Detach a set alarm from its queue and reset it to Idle. Caller holds
/// the alarm lock.
fn cancel_alarm_no_alarm_lock(k: &Kernel, alarm: OsAlarm) -> bool {
    let mem = k.mem();
    if alarm.state(mem) != AlarmState::Set {
        return false;
    }

    alarm.set_state(mem, AlarmState::Idle);
    alarm.set_next_fire(mem, 0);
    alarm.set_period(mem, 0);

    let queue = alarm.alarm_queue(mem);
    if !queue.is_null() {
        list::erase(mem, alarm_list(queue), alarm.addr(), ALARM_LINK);
        alarm.set_alarm_queue(mem, VirtAddr::NULL);
    }

    true
}

/// Cancel used by event signalling to call off a waiter's timeout alarm.
pub(crate) fn cancel_alarm_internal(k: &Kernel, alarm: OsAlarm) -> bool {
    k.alarm_lock.acquire(idlock::object_lock_id(alarm.addr()));
    let result = cancel_alarm_no_alarm_lock(k, alarm);
    k.alarm_lock.release(idlock::object_lock_id(alarm.addr()));
    result
}

/// Arm a system-group alarm. Caller holds the scheduler lock.
pub(crate) fn set_alarm_internal(
    core: &Core<'_>,
    alarm: OsAlarm,
    delay: OsTime,
    callback: VirtAddr,
    user_data: VirtAddr,
) -> bool {
    let mem = core.mem();
    alarm.set_group(mem, SYSTEM_ALARM_GROUP);
    alarm.set_user_data(mem, user_data);
    core.set_alarm(alarm, delay, callback)
}

/// Reprogram the core's next alarm interrupt from its armed queue.
fn update_cpu_alarm_no_lock(k: &Kernel, core: u32) {
    let mem = k.mem();
    let queue = k.statics.alarm[core as usize].alarm_queue;
    let mut next: Option<i64> = None;

    let mut it = alarm_list(queue).head(mem);
    while !it.is_null() {
        let alarm = OsAlarm(it);
        if alarm.state(mem) == AlarmState::Set && alarm.next_fire(mem) != 0 {
            let fire = alarm.next_fire(mem);
            next = Some(match next {
                Some(n) => n.min(fire),
                None => fire,
            });
        }
        it = list::next(mem, it, ALARM_LINK);
    }

    k.cpu().set_next_alarm(core, next);
}

/// Pop one fired alarm from the callback queue, re-arming it first if it
/// is periodic. Caller holds the scheduler and alarm locks.
fn pop_callback_alarm_no_lock(k: &Kernel, core: u32) -> OsAlarm {
    let mem = k.mem();
    let pc = &k.statics.alarm[core as usize];

    let alarm = OsAlarm(list::pop_front(mem, alarm_list(pc.callback_queue), ALARM_LINK));
    if alarm.is_null() {
        return alarm;
    }
    alarm.set_alarm_queue(mem, VirtAddr::NULL);

    if alarm.period(mem) != 0 {
        alarm.set_next_fire(mem, alarm.next_fire(mem) + alarm.period(mem));
        alarm.set_state(mem, AlarmState::Set);
        list::append(mem, alarm_list(pc.alarm_queue), alarm.addr(), ALARM_LINK);
        alarm.set_alarm_queue(mem, pc.alarm_queue);
        update_cpu_alarm_no_lock(k, core);
    }

    alarm
}

/// Dispatch one queued alarm callback; false when the queue is empty.
/// The alarm-callback thread loops over this, sleeping between batches.
pub(crate) fn alarm_callback_step(core: &Core<'_>) -> bool {
    let k = core.k;
    let mem = core.mem();

    scheduler::lock(k, core.id);
    k.alarm_lock.acquire(idlock::core_lock_id(core.id));
    let alarm = pop_callback_alarm_no_lock(k, core.id);
    k.alarm_lock.release(idlock::core_lock_id(core.id));
    scheduler::unlock(k, core.id);

    if alarm.is_null() {
        return false;
    }

    let callback = alarm.callback(mem);
    if !callback.is_null() {
        k.invoke_guest(core.id, callback, [alarm.addr().0, alarm.context(mem).0, 0, 0]);
    }
    true
}

pub(crate) fn builtin_alarm_thread_entry(k: &Kernel, core: u32, _args: [u32; 4]) -> u32 {
    let view = k.core(core);
    let mem = k.mem();
    let pc = &k.statics.alarm[core as usize];

    loop {
        scheduler::lock(k, core);
        k.alarm_lock.acquire(idlock::core_lock_id(core));

        let alarm = pop_callback_alarm_no_lock(k, core);
        if alarm.is_null() {
            // Nothing pending; sleep until the interrupt handler wakes us
            scheduler::sleep_thread_no_lock(&view, pc.callback_thread_queue);
            k.alarm_lock.release(idlock::core_lock_id(core));
            scheduler::reschedule_self_no_lock(&view);
            scheduler::unlock(k, core);
            continue;
        }

        k.alarm_lock.release(idlock::core_lock_id(core));
        scheduler::unlock(k, core);

        let callback = alarm.callback(mem);
        if !callback.is_null() {
            k.invoke_guest(core, callback, [alarm.addr().0, alarm.context(mem).0, 0, 0]);
        }
    }
}

pub(crate) fn initialise(k: &Kernel) {
    let view = k.core(MAIN_CORE);
    let mem = k.mem();

    for core in 0..CORE_COUNT {
        let pc = &k.statics.alarm[core as usize];
        mem.write_cstr(pc.name, 16, &format!("Alarm Thread {core}"));

        view.init_alarm_queue(OsAlarmQueue(pc.alarm_queue));
        view.init_alarm_queue(OsAlarmQueue(pc.callback_queue));
        list::init(mem, QueueRef(pc.callback_thread_queue));

        let thread = OsThread(pc.thread);
        view.create_thread(
            thread,
            k.builtins.alarm_thread_entry,
            core,
            VirtAddr::NULL,
            VirtAddr(pc.stack.0 + super::ALARM_THREAD_STACK_SIZE),
            super::ALARM_THREAD_STACK_SIZE,
            -1,
            ThreadAttributes::from_bits_retain(1 << core),
        );
        view.set_thread_name(thread, pc.name);
        view.resume_thread(thread);
    }
}
