/*
 * Interrupt Control
 *
 * Thin guest-facing layer over the per-core interrupt mask plus the table
 * of user interrupt handlers. The inter-core "please reschedule" interrupt
 * is delivered here: the receiving core takes the scheduler lock and
 * reschedules itself.
 */

use crate::guest::VirtAddr;
use crate::scheduler;
use crate::{Core, Kernel};

/// Number of user-visible interrupt types.
pub const INTERRUPT_TYPE_MAX: u32 = 32;

impl<'k> Core<'k> {
    /// Enable interrupts on this core; returns the previous state.
    pub fn enable_interrupts(&self) -> bool {
        self.k.cpu().set_interrupts_enabled(self.id, true)
    }

    /// Disable interrupts on this core; returns the previous state.
    pub fn disable_interrupts(&self) -> bool {
        self.k.cpu().set_interrupts_enabled(self.id, false)
    }

    pub fn restore_interrupts(&self, enable: bool) -> bool {
        self.k.cpu().set_interrupts_enabled(self.id, enable)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.k.cpu().interrupts_enabled(self.id)
    }

    /// Install a user interrupt handler, returning the previous one.
    pub fn set_interrupt_handler(&self, kind: u32, handler: VirtAddr) -> VirtAddr {
        let mem = self.mem();
        let table = self.k.statics.interrupt_handlers;
        let mut previous = VirtAddr::NULL;
        if kind < INTERRUPT_TYPE_MAX {
            let slot = table.offset(kind * 4);
            previous = mem.read_addr(slot);
            mem.write_addr(slot, handler);
        }
        previous
    }

    pub fn interrupt_handler(&self, kind: u32) -> VirtAddr {
        if kind >= INTERRUPT_TYPE_MAX {
            return VirtAddr::NULL;
        }
        self.mem().read_addr(self.k.statics.interrupt_handlers.offset(kind * 4))
    }

    /// Dispatch a user interrupt handler with rescheduling suppressed for
    /// the duration of the call.
    pub fn dispatch_user_interrupt(&self, kind: u32, context: VirtAddr) {
        let handler = self.interrupt_handler(kind);
        if handler.is_null() {
            return;
        }
        scheduler::disable(self.k, self.id);
        self.k.invoke_guest(self.id, handler, [kind, context.0, 0, 0]);
        scheduler::enable(self.k, self.id);
    }

    /// Entry point for the inter-core reschedule interrupt.
    pub fn handle_reschedule_interrupt(&self) {
        scheduler::lock(self.k, self.id);
        scheduler::reschedule_self_no_lock(self);
        scheduler::unlock(self.k, self.id);
    }
}

pub(crate) fn initialise(k: &Kernel) {
    let mem = k.mem();
    mem.fill(k.statics.interrupt_handlers, INTERRUPT_TYPE_MAX * 4, 0);
}
