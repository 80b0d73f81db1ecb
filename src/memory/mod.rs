pub mod frame_allocator;
pub mod paging;
pub mod shared;

use core::fmt;

use crate::config::PAGE_SIZE;

pub use frame_allocator::{FrameAllocator, FramePool};
pub use paging::{AddressMapper, PteFlags, Sv39, Translation, VmError};
pub use shared::SharedFrames;

/// A physical address. The kernel runs direct-mapped, so this is also the
/// address the kernel uses to reach the frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// A user (or kernel) virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

macro_rules! addr_common {
    ($ty:ident, $tag:literal) => {
        impl $ty {
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            pub const fn page_offset(self) -> usize {
                (self.0 as usize) & (PAGE_SIZE - 1)
            }

            pub const fn align_down(self) -> Self {
                $ty(self.0 & !(PAGE_SIZE as u64 - 1))
            }

            pub const fn is_aligned(self) -> bool {
                self.page_offset() == 0
            }

            pub fn checked_add(self, bytes: u64) -> Option<Self> {
                self.0.checked_add(bytes).map($ty)
            }

            /// Address of page `index` counted from this (page-aligned) address.
            pub const fn page(self, index: usize) -> Self {
                $ty(self.0 + (index * PAGE_SIZE) as u64)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!($tag, "({:#x})"), self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

addr_common!(PhysAddr, "PA");
addr_common!(VirtAddr, "VA");

/// Number of pages needed to cover `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// One physical frame worth of storage.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub const fn zeroed() -> Self {
        Page([0; PAGE_SIZE])
    }

    pub fn zero(&mut self) {
        self.0.fill(0);
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.0[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_helpers() {
        let va = VirtAddr(0x1234_5678);
        assert_eq!(va.page_offset(), 0x678);
        assert_eq!(va.align_down(), VirtAddr(0x1234_5000));
        assert!(!va.is_aligned());
        assert_eq!(VirtAddr(0x1000).page(2), VirtAddr(0x3000));
        assert_eq!(VirtAddr(u64::MAX).checked_add(1), None);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn page_words_are_little_endian() {
        let mut page = Page::zeroed();
        page.write_u64(16, 0x1122_3344_5566_7788);
        assert_eq!(page.0[16], 0x88);
        assert_eq!(page.read_u64(16), 0x1122_3344_5566_7788);
    }
}
