/*
 * Guest Memory
 *
 * The emulated kernel operates entirely on guest memory: every structure a
 * game can see (threads, mutexes, alarms, heaps, ...) lives at a fixed
 * 32-bit virtual address and has a fixed big-endian layout. This module
 * provides the memory arena, typed virtual addresses, and the endian
 * accessors everything else is built on.
 *
 * Mutation goes through `&self`. All writers are serialized by the kernel
 * locks (scheduler id-lock, alarm id-lock, per-heap spinlocks), which is
 * the same discipline the guest itself relies on.
 */

pub mod list;
#[macro_use]
pub mod layout;

use core::cell::UnsafeCell;
use core::fmt;

/// A 32-bit guest virtual address.
///
/// Address 0 is the guest null pointer and is never mapped.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const NULL: VirtAddr = VirtAddr(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn offset(self, bytes: u32) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(bytes))
    }

    #[inline]
    pub fn align_up(self, align: u32) -> VirtAddr {
        VirtAddr((self.0 + align - 1) & !(align - 1))
    }

    #[inline]
    pub fn align_down(self, align: u32) -> VirtAddr {
        VirtAddr(self.0 & !(align - 1))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr(0x{:08X})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// One mapped range of guest memory. Backed by `u32` storage so 4-byte
/// aligned guest words can be accessed atomically.
struct Region {
    start: u32,
    len: u32,
    bytes: UnsafeCell<Box<[u32]>>,
}

/// The guest memory arena: a small set of mapped regions (MEM2, MEM1, the
/// foreground bucket, per-core locked cache).
///
/// Out-of-range accesses indicate a bug in the emulator or a corrupted
/// guest structure and are fatal.
pub struct GuestMemory {
    regions: Vec<Region>,
}

// Writers are serialized by the kernel locks; see the module docs.
unsafe impl Sync for GuestMemory {}
unsafe impl Send for GuestMemory {}

impl GuestMemory {
    pub fn new() -> GuestMemory {
        GuestMemory { regions: Vec::new() }
    }

    /// Map a zero-filled region. Regions must not overlap; start and
    /// length are 4-byte granular.
    pub fn map(&mut self, start: u32, len: u32) {
        assert!(len > 0, "cannot map an empty guest region");
        assert!(start > 0, "guest region cannot include the null page");
        assert!(start % 4 == 0 && len % 4 == 0, "guest region is not word granular");
        assert!(start.checked_add(len - 1).is_some(), "guest region wraps");
        for r in &self.regions {
            let overlaps = start < r.start + r.len && r.start < start + len;
            assert!(!overlaps, "guest region 0x{start:08X} overlaps existing mapping");
        }
        self.regions.push(Region {
            start,
            len,
            bytes: UnsafeCell::new(vec![0u32; (len / 4) as usize].into_boxed_slice()),
        });
    }

    pub fn is_mapped(&self, addr: VirtAddr) -> bool {
        self.regions
            .iter()
            .any(|r| addr.0 >= r.start && addr.0 < r.start + r.len)
    }

    #[inline]
    fn translate(&self, addr: VirtAddr, len: u32) -> *mut u8 {
        for r in &self.regions {
            if addr.0 >= r.start && addr.0 - r.start < r.len {
                let off = addr.0 - r.start;
                assert!(
                    len <= r.len - off,
                    "guest access crosses region end: {addr} + 0x{len:X}"
                );
                unsafe {
                    return ((*r.bytes.get()).as_mut_ptr() as *mut u8).add(off as usize);
                }
            }
        }
        panic!("unmapped guest access: {addr} + 0x{len:X}");
    }

    #[inline]
    pub fn read_u8(&self, addr: VirtAddr) -> u8 {
        unsafe { *self.translate(addr, 1) }
    }

    #[inline]
    pub fn write_u8(&self, addr: VirtAddr, value: u8) {
        unsafe { *self.translate(addr, 1) = value }
    }

    #[inline]
    pub fn read_u16(&self, addr: VirtAddr) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf);
        u16::from_be_bytes(buf)
    }

    #[inline]
    pub fn write_u16(&self, addr: VirtAddr, value: u16) {
        self.write_bytes(addr, &value.to_be_bytes());
    }

    #[inline]
    pub fn read_u32(&self, addr: VirtAddr) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_be_bytes(buf)
    }

    #[inline]
    pub fn write_u32(&self, addr: VirtAddr, value: u32) {
        self.write_bytes(addr, &value.to_be_bytes());
    }

    #[inline]
    pub fn read_u64(&self, addr: VirtAddr) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        u64::from_be_bytes(buf)
    }

    #[inline]
    pub fn write_u64(&self, addr: VirtAddr, value: u64) {
        self.write_bytes(addr, &value.to_be_bytes());
    }

    #[inline]
    pub fn read_i32(&self, addr: VirtAddr) -> i32 {
        self.read_u32(addr) as i32
    }

    #[inline]
    pub fn write_i32(&self, addr: VirtAddr, value: i32) {
        self.write_u32(addr, value as u32)
    }

    #[inline]
    pub fn read_i64(&self, addr: VirtAddr) -> i64 {
        self.read_u64(addr) as i64
    }

    #[inline]
    pub fn write_i64(&self, addr: VirtAddr, value: i64) {
        self.write_u64(addr, value as u64)
    }

    #[inline]
    pub fn read_addr(&self, addr: VirtAddr) -> VirtAddr {
        VirtAddr(self.read_u32(addr))
    }

    #[inline]
    pub fn write_addr(&self, addr: VirtAddr, value: VirtAddr) {
        self.write_u32(addr, value.0)
    }

    pub fn read_bytes(&self, addr: VirtAddr, buf: &mut [u8]) {
        let p = self.translate(addr, buf.len() as u32);
        unsafe { core::ptr::copy_nonoverlapping(p, buf.as_mut_ptr(), buf.len()) }
    }

    pub fn write_bytes(&self, addr: VirtAddr, buf: &[u8]) {
        let p = self.translate(addr, buf.len() as u32);
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), p, buf.len()) }
    }

    pub fn fill(&self, addr: VirtAddr, len: u32, value: u8) {
        let p = self.translate(addr, len);
        unsafe { core::ptr::write_bytes(p, value, len as usize) }
    }

    /// memmove between two guest ranges.
    pub fn copy(&self, dst: VirtAddr, src: VirtAddr, len: u32) {
        if len == 0 {
            return;
        }
        let s = self.translate(src, len);
        let d = self.translate(dst, len);
        unsafe { core::ptr::copy(s, d, len as usize) }
    }

    #[inline]
    fn atomic_u32(&self, addr: VirtAddr) -> &core::sync::atomic::AtomicU32 {
        assert!(addr.0 % 4 == 0, "atomic access to unaligned address {addr}");
        let p = self.translate(addr, 4);
        unsafe { &*(p as *const core::sync::atomic::AtomicU32) }
    }

    /// Compare-and-swap on a guest word. Values are logical (host-order);
    /// storage stays big-endian.
    pub fn cas_u32(&self, addr: VirtAddr, expected: u32, new: u32) -> bool {
        use core::sync::atomic::Ordering;
        self.atomic_u32(addr)
            .compare_exchange(expected.to_be(), new.to_be(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn load_u32_acquire(&self, addr: VirtAddr) -> u32 {
        use core::sync::atomic::Ordering;
        u32::from_be(self.atomic_u32(addr).load(Ordering::Acquire))
    }

    pub fn store_u32_release(&self, addr: VirtAddr, value: u32) {
        use core::sync::atomic::Ordering;
        self.atomic_u32(addr).store(value.to_be(), Ordering::Release)
    }

    /// Read a NUL-terminated guest string, for diagnostics only.
    pub fn read_cstr(&self, addr: VirtAddr) -> String {
        if addr.is_null() {
            return String::new();
        }
        let mut out = Vec::new();
        let mut p = addr;
        loop {
            let b = self.read_u8(p);
            if b == 0 || out.len() >= 256 {
                break;
            }
            out.push(b);
            p = p.offset(1);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Write a NUL-terminated string into a fixed-size guest buffer.
    pub fn write_cstr(&self, addr: VirtAddr, cap: u32, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(cap as usize - 1);
        self.write_bytes(addr, &bytes[..n]);
        self.write_u8(addr.offset(n as u32), 0);
    }
}
