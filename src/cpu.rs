/*
 * CPU Abstraction
 *
 * The emulated PowerPC cores live outside this crate. Everything the
 * kernel needs from them goes through the `Cpu` trait: switching a core to
 * a different register context, invoking a guest function, raising the
 * inter-core interrupt, masking interrupts, programming the next alarm
 * interrupt, and reading the time base.
 */

use crate::guest::VirtAddr;

/// Number of emulated cores.
pub const CORE_COUNT: u32 = 3;

/// Core 1 is the main core; it runs the application's entry thread.
pub const MAIN_CORE: u32 = 1;

pub trait Cpu: Send + Sync {
    /// Switch `core` to a new register context. `None` parks the core in
    /// its idle loop until an interrupt arrives.
    ///
    /// For a context that belongs to an exiting thread this call does not
    /// logically return: the implementation must never resume `from`
    /// unless the scheduler selects it again.
    fn switch_context(&self, core: u32, from: Option<VirtAddr>, to: Option<VirtAddr>);

    /// Invoke a guest function on `core` using the core's current register
    /// context, returning the guest function's result.
    fn invoke(&self, core: u32, func: VirtAddr, args: [u32; 4]) -> u32;

    /// Raise the generic inter-core interrupt on `core`.
    fn interrupt(&self, core: u32);

    /// Enable or disable external interrupt delivery on `core`, returning
    /// the previous state.
    fn set_interrupts_enabled(&self, core: u32, enabled: bool) -> bool;

    fn interrupts_enabled(&self, core: u32) -> bool;

    /// Service any pending interrupts on `core`. Called from busy-wait
    /// loops which would otherwise starve interrupt delivery.
    fn check_interrupts(&self, core: u32);

    /// Program the next alarm interrupt for `core`; `None` disarms it.
    /// `at` is an absolute time-base tick value.
    fn set_next_alarm(&self, core: u32, at: Option<i64>);

    /// Current value of the time-base register.
    fn time_base(&self) -> i64;
}

/// Affinity mask bit for a core.
#[inline]
pub fn core_mask(core: u32) -> u8 {
    1 << core
}
