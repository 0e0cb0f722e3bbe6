use super::*;
use crate::guest::VirtAddr;
use crate::testkit::TestKernel;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn spawn_block(t: &TestKernel) -> (OsThread, VirtAddr, u32) {
    let thread = OsThread(t.alloc(OsThread::SIZE, 8));
    let stack_size = 0x2000;
    let stack = t.alloc(stack_size, 8);
    (thread, VirtAddr(stack.0 + stack_size), stack_size)
}

#[test]
fn create_thread_initial_state() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let (thread, stack_top, stack_size) = spawn_block(&t);
    let entry = t.cpu.register_fn(|_, _| 0);
    assert!(core.create_thread(
        thread,
        entry,
        2,
        VirtAddr(0x1234),
        stack_top,
        stack_size,
        16,
        ThreadAttributes::empty(),
    ));

    assert_eq!(thread.tag(mem), THREAD_TAG);
    assert_eq!(thread.state(mem), ThreadState::Ready);
    assert_eq!(thread.suspend_counter(mem), 1);
    assert_eq!(thread.priority(mem), 16);
    assert_eq!(thread.base_priority(mem), 16);
    assert_eq!(thread.exit_value(mem), -1);
    assert_eq!(thread.entry_point(mem), entry);
    // No affinity given: inherited from the creator (pinned to core 1)
    assert_eq!(thread.affinity(mem), 0b010);
    // Stack bounds and overflow sentinel
    assert_eq!(thread.stack_start(mem), stack_top);
    assert_eq!(thread.stack_end(mem), VirtAddr(stack_top.0 - stack_size));
    assert_eq!(mem.read_u32(thread.stack_end(mem)), STACK_SENTINEL);
    // Entry arguments staged in the context
    assert_eq!(thread.context().gpr(mem, 3), 2);
    assert_eq!(thread.context().gpr(mem, 4), 0x1234);
    assert_eq!(thread.context().srr0(mem), t.k.builtins.thread_entry.0);
}

#[test]
fn create_thread_without_entry_is_inert() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let (thread, stack_top, stack_size) = spawn_block(&t);
    core.create_thread(
        thread,
        VirtAddr::NULL,
        0,
        VirtAddr::NULL,
        stack_top,
        stack_size,
        16,
        ThreadAttributes::empty(),
    );

    assert_eq!(thread.state(mem), ThreadState::None);
    assert_eq!(thread.suspend_counter(mem), 0);
    assert!(!t.ready_queue(1).contains(&thread));
}

#[test]
fn exit_then_join_returns_the_exit_value() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let j = t.spawn_thread(&core, 20, 0b010);
    assert_eq!(core.current_thread(), j);

    core.exit_thread(5);
    assert_eq!(j.state(mem), ThreadState::Moribund);
    assert_eq!(j.exit_value(mem), 5);
    assert_eq!(core.current_thread(), t.default_thread(1));

    let mut value = 0;
    assert!(core.join_thread(j, Some(&mut value)));
    assert_eq!(value, 5);
    assert_eq!(j.state(mem), ThreadState::None);
}

#[test]
fn exit_wakes_the_joiner() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let j = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, t.default_thread(1));

    // The joiner goes to sleep on the join queue
    core.join_thread(j, None);
    assert_eq!(t.queue_members(j.join_queue().addr()), vec![t.default_thread(1)]);

    t.make_current(1, j);
    core.exit_thread(7);
    assert!(t.queue_members(j.join_queue().addr()).is_empty());
    assert_ne!(t.default_thread(1).state(mem), ThreadState::Waiting);
}

#[test]
fn detached_exit_skips_moribund_and_runs_the_deallocator() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();
    let dealloc = t.cpu.register_fn(move |_, args| {
        assert_ne!(args[0], 0);
        calls2.fetch_add(1, Ordering::SeqCst);
        0
    });

    let e = t.spawn_thread(&core, 20, 0b010);
    core.set_thread_deallocator(e, dealloc);
    core.detach_thread(e);
    assert_ne!(e.attr(mem) & ThreadAttributes::DETACHED.bits(), 0);

    t.make_current(1, e);
    core.exit_thread(0);
    // Straight to None, no Moribund stop-over
    assert_eq!(e.state(mem), ThreadState::None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The deallocator thread drains the queue
    assert!(deallocator_step(&core));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!deallocator_step(&core));
}

#[test]
fn detach_after_exit_reaps_the_thread() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let d = t.spawn_thread(&core, 20, 0b010);
    core.exit_thread(3);
    assert_eq!(d.state(mem), ThreadState::Moribund);

    core.detach_thread(d);
    assert_eq!(d.state(mem), ThreadState::None);
}

#[test]
fn cancel_takes_effect_at_the_cancel_point() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let c = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, t.default_thread(1));

    core.cancel_thread(c);
    assert_eq!(c.request_flag(mem), ThreadRequest::Cancel);
    assert_ne!(c.state(mem), ThreadState::Moribund);

    // The thread hits its next cancellation point
    t.make_current(1, c);
    core.test_thread_cancel();
    assert_eq!(c.state(mem), ThreadState::Moribund);
    assert_eq!(c.exit_value(mem), -1);
}

#[test]
fn cancel_is_deferred_while_cancellation_is_disabled() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let c = t.spawn_thread(&core, 20, 0b010);
    assert!(core.set_thread_cancel_state(false));
    t.make_current(1, t.default_thread(1));
    core.cancel_thread(c);

    t.make_current(1, c);
    core.test_thread_cancel();
    // Still alive; the request stays pending
    assert_eq!(c.state(mem), ThreadState::Running);
    assert_eq!(c.request_flag(mem), ThreadRequest::Cancel);

    assert!(!core.set_thread_cancel_state(true));
    core.test_thread_cancel();
    assert_eq!(c.state(mem), ThreadState::Moribund);
}

#[test]
fn run_thread_restarts_a_dead_thread() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let r = t.spawn_thread(&core, 20, 0b010);
    core.exit_thread(0);
    assert!(core.is_thread_terminated(r));

    let entry = t.cpu.register_fn(|_, _| 0);
    assert!(core.run_thread(r, entry, 0, VirtAddr::NULL));
    assert!(!core.is_thread_terminated(r));
    assert_eq!(r.entry_point(mem), entry);

    // Running threads cannot be restarted
    assert!(!core.run_thread(r, entry, 0, VirtAddr::NULL));
}

#[test]
fn sleep_ticks_arms_a_system_alarm() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();
    let default = t.default_thread(1);

    let delay = crate::time::ms_to_ticks(10);
    let wake_at = t.k.time() + delay;
    core.sleep_ticks(delay);

    assert_eq!(default.state(mem), ThreadState::Waiting);
    assert_eq!(t.cpu.next_alarms.lock()[1], Some(wake_at));

    // Fire the alarm: the inline system handler wakes the sleeper
    t.cpu.advance(delay + 1);
    core.handle_alarm_interrupt(default.context());
    assert_eq!(default.state(mem), ThreadState::Ready);
    assert_eq!(t.cpu.next_alarms.lock()[1], None);
}

#[test]
fn thread_specific_slots_and_names() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    core.set_thread_specific(3, 0xAABB);
    assert_eq!(core.thread_specific(3), 0xAABB);
    assert_eq!(core.thread_specific(4), 0);

    let name = t.alloc(16, 4);
    mem.write_cstr(name, 16, "worker");
    let w = t.spawn_thread(&core, 20, 0b010);
    core.set_thread_name(w, name);
    assert_eq!(mem.read_cstr(core.thread_name(w)), "worker");
}

#[test]
fn stack_usage_watermark() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let s = t.spawn_thread(&core, 20, 0b010);
    t.make_current(1, t.default_thread(1));

    assert!(core.set_thread_stack_usage(s));
    assert_ne!(s.attr(mem) & ThreadAttributes::STACK_USAGE.bits(), 0);

    // Only the bootstrap frame below the stack top is unmarked
    assert_eq!(core.check_thread_stack_usage(s), 8);

    core.clear_thread_stack_usage(s);
    assert_eq!(s.attr(mem) & ThreadAttributes::STACK_USAGE.bits(), 0);
}

#[test]
fn user_stack_pointer_blocks_cancellation() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();
    let thread = core.current_thread();

    let foreign = t.alloc(0x100, 8);
    core.set_user_stack_pointer(foreign);
    assert_eq!(thread.user_stack_pointer(mem), foreign);
    assert_ne!(
        thread.cancel_state(mem) & CancelState::DISABLED_BY_USER_STACK_POINTER.bits(),
        0
    );

    // Restoring a pointer inside the real stack clears the override
    let inside = VirtAddr(thread.stack_start(mem).0 - 0x40);
    core.remove_user_stack_pointer(inside);
    assert!(thread.user_stack_pointer(mem).is_null());
    assert_eq!(
        thread.cancel_state(mem) & CancelState::DISABLED_BY_USER_STACK_POINTER.bits(),
        0
    );
}

#[test]
fn pin_and_unpin_affinity() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let mem = t.k.mem();

    let a = t.spawn_thread(&core, 20, 0b111);
    t.make_current(1, a);

    let old = core.pin_thread_affinity();
    assert_eq!(old, 0b111);
    assert_eq!(a.affinity(mem), 0b010);

    core.unpin_thread_affinity(old);
    assert_eq!(a.affinity(mem), 0b111);
}

#[test]
fn active_thread_count_tracks_lifecycle() {
    let t = TestKernel::new();
    let core = t.k.core(1);

    let before = core.check_active_threads();
    let a = t.spawn_thread(&core, 20, 0b010);
    assert_eq!(core.check_active_threads(), before + 1);

    t.make_current(1, a);
    core.exit_thread(0);
    // Moribund threads stay on the active list until joined
    assert_eq!(core.check_active_threads(), before + 1);
    core.join_thread(a, None);
    assert_eq!(core.check_active_threads(), before);
}

#[test]
#[should_panic(expected = "quantum scheduling is not supported")]
fn run_quantum_is_explicitly_unsupported() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let a = t.spawn_thread(&core, 20, 0b010);
    core.set_thread_run_quantum(a, 1000);
}

#[test]
fn run_quantum_rejects_out_of_range_values() {
    let t = TestKernel::new();
    let core = t.k.core(1);
    let a = t.spawn_thread(&core, 20, 0b010);
    assert!(!core.set_thread_run_quantum(a, 50));
    assert!(!core.set_thread_run_quantum(a, 2_000_000));
}
