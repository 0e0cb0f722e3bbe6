/*
 * Rendezvous
 *
 * Three per-core flags. A waiter publishes its own core's flag and then
 * busy-polls until every core named in the mask has published, servicing
 * pending interrupts between polls. No lock is held while waiting.
 */

use crate::cpu::CORE_COUNT;
use crate::time;
use crate::Core;

guest_struct! {
    pub struct OsRendezvous : 0x10 {
        0x00 => core0, set_core0: u32;
        0x04 => core1, set_core1: u32;
        0x08 => core2, set_core2: u32;
    }
}

impl<'k> Core<'k> {
    pub fn init_rendezvous(&self, rendezvous: OsRendezvous) {
        let mem = self.mem();
        for core in 0..CORE_COUNT {
            mem.store_u32_release(rendezvous.addr().offset(core * 4), 0);
        }
    }

    /// Wait until every core in `core_mask` has reached the rendezvous.
    pub fn wait_rendezvous(&self, rendezvous: OsRendezvous, core_mask: u32) -> bool {
        self.wait_rendezvous_with_timeout(rendezvous, core_mask, -1)
    }

    /// As `wait_rendezvous` with a timeout in nanoseconds (-1 waits
    /// forever). Returns false on timeout.
    pub fn wait_rendezvous_with_timeout(
        &self,
        rendezvous: OsRendezvous,
        core_mask: u32,
        timeout_ns: i64,
    ) -> bool {
        let k = self.k;
        let mem = self.mem();
        let end_time = k.time() + time::ns_to_ticks(timeout_ns);

        let mut waiting = [false; CORE_COUNT as usize];
        for core in 0..CORE_COUNT {
            waiting[core as usize] = core_mask & (1 << core) != 0;
        }

        // Publish our own arrival
        mem.store_u32_release(rendezvous.addr().offset(self.id * 4), 1);

        loop {
            for core in 0..CORE_COUNT {
                if waiting[core as usize]
                    && mem.load_u32_acquire(rendezvous.addr().offset(core * 4)) != 0
                {
                    waiting[core as usize] = false;
                }
            }

            if waiting.iter().all(|w| !w) {
                return true;
            }

            if timeout_ns != -1 && k.time() >= end_time {
                return false;
            }

            // Busy wait: keep interrupt delivery alive by hand
            k.cpu().check_interrupts(self.id);
        }
    }
}
