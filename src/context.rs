/*
 * Register Context Block
 *
 * Each thread owns a 0x320-byte register context at the start of its
 * control block. The layout is shared with the CPU abstraction, which
 * saves and restores emulated registers through the same offsets. The
 * kernel itself only touches a handful of fields: the stack pointer
 * (gpr1), argument registers, the entry address, PIR, the spin-lock count
 * and the per-core time accounting slots.
 */

use crate::guest::{GuestMemory, VirtAddr};

guest_struct! {
    pub struct OsContext : 0x320 {
        0x000 => tag, set_tag: u64;
        // gpr[0..32] at 0x008, 4 bytes each
        0x088 => cr, set_cr: u32;
        0x08C => lr, set_lr: u32;
        0x090 => ctr, set_ctr: u32;
        0x094 => xer, set_xer: u32;
        // Resume address
        0x098 => srr0, set_srr0: u32;
        0x09C => srr1, set_srr1: u32;
        0x0A0 => fpscr, set_fpscr: u32;
        // fpr[0..32] at 0x0A8, 8 bytes each
        // gqr[0..8] at 0x1A8
        0x1C8 => pir, set_pir: u32;
        0x1CC => attr, set_attr: u32;
        0x1D0 => spin_lock_count, set_spin_lock_count: u32;
        0x1D4 => state, set_state: u16;
        0x1D8 => starttime, set_starttime: i64;
        // coretime[0..3] at 0x1E0, 8 bytes each
    }
}

pub const CONTEXT_TAG: u64 = 0x4F53_436F_6E74_7874; // "OSContxt"

const OFF_GPR: u32 = 0x008;
const OFF_FPR: u32 = 0x0A8;
const OFF_GQR: u32 = 0x1A8;
const OFF_CORETIME: u32 = 0x1E0;

impl OsContext {
    #[inline]
    pub fn gpr(self, mem: &GuestMemory, n: u32) -> u32 {
        debug_assert!(n < 32);
        mem.read_u32(self.0.offset(OFF_GPR + n * 4))
    }

    #[inline]
    pub fn set_gpr(self, mem: &GuestMemory, n: u32, value: u32) {
        debug_assert!(n < 32);
        mem.write_u32(self.0.offset(OFF_GPR + n * 4), value)
    }

    #[inline]
    pub fn fpr_bits(self, mem: &GuestMemory, n: u32) -> u64 {
        debug_assert!(n < 32);
        mem.read_u64(self.0.offset(OFF_FPR + n * 8))
    }

    #[inline]
    pub fn set_fpr_bits(self, mem: &GuestMemory, n: u32, value: u64) {
        debug_assert!(n < 32);
        mem.write_u64(self.0.offset(OFF_FPR + n * 8), value)
    }

    #[inline]
    pub fn gqr(self, mem: &GuestMemory, n: u32) -> u32 {
        debug_assert!(n < 8);
        mem.read_u32(self.0.offset(OFF_GQR + n * 4))
    }

    #[inline]
    pub fn set_gqr(self, mem: &GuestMemory, n: u32, value: u32) {
        debug_assert!(n < 8);
        mem.write_u32(self.0.offset(OFF_GQR + n * 4), value)
    }

    #[inline]
    pub fn coretime(self, mem: &GuestMemory, core: u32) -> i64 {
        debug_assert!(core < 3);
        mem.read_i64(self.0.offset(OFF_CORETIME + core * 8))
    }

    #[inline]
    pub fn set_coretime(self, mem: &GuestMemory, core: u32, value: i64) {
        debug_assert!(core < 3);
        mem.write_i64(self.0.offset(OFF_CORETIME + core * 8), value)
    }

    /// Stack pointer register.
    #[inline]
    pub fn sp(self, mem: &GuestMemory) -> VirtAddr {
        VirtAddr(self.gpr(mem, 1))
    }

    #[inline]
    pub fn set_sp(self, mem: &GuestMemory, sp: VirtAddr) {
        self.set_gpr(mem, 1, sp.0)
    }

    /// Reset the context for a fresh dispatch at `entry` with stack `sp`.
    pub fn init(self, mem: &GuestMemory, entry: VirtAddr, sp: VirtAddr) {
        mem.fill(self.0, Self::SIZE, 0);
        self.set_tag(mem, CONTEXT_TAG);
        self.set_srr0(mem, entry.0);
        self.set_sp(mem, sp);
    }
}
