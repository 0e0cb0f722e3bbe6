/*
 * Coroutines
 *
 * A coroutine block is a snapshot of the callee-saved register set. Load
 * and save are plain copies between the block and the current thread's
 * context; switch is a save followed by a load.
 */

use crate::Core;

guest_struct! {
    pub struct OsCoroutine : 0x180 {
        0x00 => lr, set_lr: u32;
        0x04 => cr, set_cr: u32;
        0x08 => gqr1, set_gqr1: u32;
        0x0C => gpr1, set_gpr1: u32;
        0x10 => gpr2, set_gpr2: u32;
        // gpr 13..31 at 0x14, fpr 14..31 at 0x60, ps 14..31 at 0xF0
    }
}

const OFF_GPR13: u32 = 0x14;
const OFF_FPR14: u32 = 0x60;

impl OsCoroutine {
    fn gpr(self, mem: &crate::guest::GuestMemory, n: u32) -> u32 {
        debug_assert!((13..32).contains(&n));
        mem.read_u32(self.0.offset(OFF_GPR13 + (n - 13) * 4))
    }

    fn set_gpr(self, mem: &crate::guest::GuestMemory, n: u32, v: u32) {
        debug_assert!((13..32).contains(&n));
        mem.write_u32(self.0.offset(OFF_GPR13 + (n - 13) * 4), v)
    }

    fn fpr_bits(self, mem: &crate::guest::GuestMemory, n: u32) -> u64 {
        debug_assert!((14..32).contains(&n));
        mem.read_u64(self.0.offset(OFF_FPR14 + (n - 14) * 8))
    }

    fn set_fpr_bits(self, mem: &crate::guest::GuestMemory, n: u32, v: u64) {
        debug_assert!((14..32).contains(&n));
        mem.write_u64(self.0.offset(OFF_FPR14 + (n - 14) * 8), v)
    }
}

impl<'k> Core<'k> {
    pub fn init_coroutine(&self, coroutine: OsCoroutine, entry: u32, stack: u32) {
        let mem = self.mem();
        coroutine.set_lr(mem, entry);
        coroutine.set_gpr1(mem, stack);
    }

    /// Restore the coroutine's registers into the current thread context.
    /// The coroutine resumes seeing `return_value` in r3.
    pub fn load_coroutine(&self, coroutine: OsCoroutine, return_value: u32) -> u32 {
        let mem = self.mem();
        let ctx = self.current_thread().context();

        ctx.set_lr(mem, coroutine.lr(mem));
        ctx.set_cr(mem, coroutine.cr(mem));
        ctx.set_gqr(mem, 1, coroutine.gqr1(mem));
        ctx.set_gpr(mem, 1, coroutine.gpr1(mem));
        ctx.set_gpr(mem, 2, coroutine.gpr2(mem));
        ctx.set_gpr(mem, 3, return_value);
        for n in 13..32 {
            ctx.set_gpr(mem, n, coroutine.gpr(mem, n));
        }
        for n in 14..32 {
            ctx.set_fpr_bits(mem, n, coroutine.fpr_bits(mem, n));
        }

        return_value
    }

    /// Capture the current thread context into the coroutine. Returns 0,
    /// so `switch_coroutine` can tell a fresh save from a resume.
    pub fn save_coroutine(&self, coroutine: OsCoroutine) -> u32 {
        let mem = self.mem();
        let ctx = self.current_thread().context();

        coroutine.set_lr(mem, ctx.lr(mem));
        coroutine.set_cr(mem, ctx.cr(mem));
        coroutine.set_gqr1(mem, ctx.gqr(mem, 1));
        coroutine.set_gpr1(mem, ctx.gpr(mem, 1));
        coroutine.set_gpr2(mem, ctx.gpr(mem, 2));
        for n in 13..32 {
            coroutine.set_gpr(mem, n, ctx.gpr(mem, n));
        }
        for n in 14..32 {
            coroutine.set_fpr_bits(mem, n, ctx.fpr_bits(mem, n));
        }

        0
    }

    pub fn switch_coroutine(&self, from: OsCoroutine, to: OsCoroutine) {
        if self.save_coroutine(from) == 0 {
            self.load_coroutine(to, 1);
        }
    }
}
