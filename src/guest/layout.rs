/*
 * Guest Structure Layouts
 *
 * `guest_struct!` declares a guest-visible structure as a thin wrapper
 * around its virtual address plus a set of fixed-offset, big-endian field
 * accessors. Offsets are written out explicitly so they can be checked
 * against the console's ABI one line at a time.
 */

/// Declare a guest structure.
///
/// ```ignore
/// guest_struct! {
///     pub struct OsSemaphore : 0x20 {
///         0x00 => tag, set_tag: u32;
///         0x04 => name, set_name: addr;
///         0x0C => count, set_count: i32;
///         0x10 => queue: struct ThreadQueue;
///     }
/// }
/// ```
///
/// Scalar fields get a getter and setter taking the guest memory; `addr`
/// fields read and write `VirtAddr`; `struct` fields return the embedded
/// structure's wrapper without touching memory.
#[macro_export]
macro_rules! guest_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident : $size:literal {
            $( $field:tt )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub struct $name(pub $crate::guest::VirtAddr);

        impl $name {
            pub const SIZE: u32 = $size;

            pub const NULL: $name = $name($crate::guest::VirtAddr::NULL);

            #[inline]
            pub fn at(addr: $crate::guest::VirtAddr) -> $name {
                $name(addr)
            }

            #[inline]
            pub fn addr(self) -> $crate::guest::VirtAddr {
                self.0
            }

            #[inline]
            pub fn is_null(self) -> bool {
                self.0.is_null()
            }

            guest_struct!(@fields $( $field )*);
        }
    };

    (@fields) => {};

    (@fields $off:expr => $get:ident, $set:ident : u8; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, u8, read_u8, write_u8);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident, $set:ident : u16; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, u16, read_u16, write_u16);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident, $set:ident : u32; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, u32, read_u32, write_u32);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident, $set:ident : u64; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, u64, read_u64, write_u64);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident, $set:ident : i32; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, i32, read_i32, write_i32);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident, $set:ident : i64; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, i64, read_i64, write_i64);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident, $set:ident : addr; $($rest:tt)*) => {
        guest_struct!(@scalar $off, $get, $set, $crate::guest::VirtAddr, read_addr, write_addr);
        guest_struct!(@fields $($rest)*);
    };
    (@fields $off:expr => $get:ident : struct $sub:ident; $($rest:tt)*) => {
        #[inline]
        pub fn $get(self) -> $sub {
            $sub(self.0.offset($off))
        }
        guest_struct!(@fields $($rest)*);
    };

    (@scalar $off:expr, $get:ident, $set:ident, $ty:ty, $read:ident, $write:ident) => {
        #[inline]
        pub fn $get(self, mem: &$crate::guest::GuestMemory) -> $ty {
            mem.$read(self.0.offset($off))
        }

        #[inline]
        pub fn $set(self, mem: &$crate::guest::GuestMemory, value: $ty) {
            mem.$write(self.0.offset($off), value)
        }
    };
}
