//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in basalt.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! big-endian wrapper types (U16, U32). All multi-byte integers in basalt's
//! on-disk structures are big-endian so that byte-wise comparison of encoded
//! keys (body followed by the component counter) matches numeric order.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::big_endian::{U16, U32};
//!
//! #[repr(C)]
//! struct Header {
//!     revision: U32,
//!     dir_end: U16,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         revision: u32,
//!         dir_end: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn revision(&self) -> u32 { self.revision.get() }
//! // pub fn set_revision(&mut self, val: u32) { self.revision = U32::new(val); }
//! // pub fn dir_end(&self) -> u16 { self.dir_end.get() }
//! // pub fn set_dir_end(&mut self, val: u16) { self.dir_end = U16::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy big-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::big_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::big_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u8) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u8 {
                self.$field
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u8) {
                self.$field = val;
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
