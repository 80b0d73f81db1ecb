use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;

use super::{Page, PhysAddr};
use crate::config::PAGE_SIZE;

/// Physical frame allocator consumed by the process core.
///
/// Frames handed out by `alloc_page` are zero-filled. Because the kernel is
/// direct-mapped, `page`/`page_mut` give access to a frame by its physical
/// address.
pub trait FrameAllocator {
    fn alloc_page(&mut self) -> Option<PhysAddr>;
    fn free_page(&mut self, pa: PhysAddr);
    fn page(&self, pa: PhysAddr) -> &Page;
    fn page_mut(&mut self, pa: PhysAddr) -> &mut Page;
    fn free_frames(&self) -> usize;
}

/// Frame allocator over one contiguous region of RAM.
///
/// Allocation state lives in a bitmap (one bit per frame); a search hint
/// keeps the common case of allocating right after the last allocation cheap.
pub struct FramePool {
    base: PhysAddr,
    frames: &'static mut [Page],
    bitmap: Vec<u64>,
    free: usize,
    hint: usize,
}

impl FramePool {
    /// Manage `frames`, whose first page sits at physical address `base`.
    pub fn new(base: PhysAddr, frames: &'static mut [Page]) -> Self {
        assert!(base.is_aligned(), "frame pool base {:?} is not page aligned", base);
        let count = frames.len();
        FramePool {
            base,
            frames,
            bitmap: vec![0; (count + 63) / 64],
            free: count,
            hint: 0,
        }
    }

    /// Manage the RAM between `start` and `end` in the direct map.
    ///
    /// # Safety
    /// The range must be unused, page aligned RAM owned by nobody else for
    /// the rest of the kernel's life.
    pub unsafe fn from_region(start: PhysAddr, end: PhysAddr) -> Self {
        let count = ((end.0 - start.0) as usize) / PAGE_SIZE;
        let frames = core::slice::from_raw_parts_mut(start.0 as *mut Page, count);
        FramePool::new(start, frames)
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa.0 >= self.base.0 && pa.0 < self.base.0 + (self.frames.len() * PAGE_SIZE) as u64
    }

    pub fn is_allocated(&self, pa: PhysAddr) -> bool {
        self.contains(pa) && self.bit(self.index_of(pa))
    }

    fn index_of(&self, pa: PhysAddr) -> usize {
        if !self.contains(pa) {
            panic!("frame pool: {:?} outside [{:?}, +{} frames)", pa, self.base, self.frames.len());
        }
        ((pa.0 - self.base.0) as usize) / PAGE_SIZE
    }

    fn bit(&self, index: usize) -> bool {
        self.bitmap[index / 64].get_bit(index % 64)
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        self.bitmap[index / 64].set_bit(index % 64, value);
    }
}

impl FrameAllocator for FramePool {
    fn alloc_page(&mut self) -> Option<PhysAddr> {
        if self.free == 0 {
            return None;
        }
        let count = self.frames.len();
        let index = (0..count)
            .map(|step| (self.hint + step) % count)
            .find(|&i| !self.bit(i))?;
        self.set_bit(index, true);
        self.free -= 1;
        self.hint = (index + 1) % count;
        self.frames[index].zero();
        Some(PhysAddr(self.base.0 + (index * PAGE_SIZE) as u64))
    }

    fn free_page(&mut self, pa: PhysAddr) {
        if !pa.is_aligned() {
            panic!("free_page: {:?} is not page aligned", pa);
        }
        let index = self.index_of(pa);
        if !self.bit(index) {
            panic!("free_page: double free of {:?}", pa);
        }
        self.set_bit(index, false);
        self.free += 1;
    }

    fn page(&self, pa: PhysAddr) -> &Page {
        &self.frames[self.index_of(pa.align_down())]
    }

    fn page_mut(&mut self, pa: PhysAddr) -> &mut Page {
        let index = self.index_of(pa.align_down());
        &mut self.frames[index]
    }

    fn free_frames(&self) -> usize {
        self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn pool(frames: usize) -> FramePool {
        let pages = Box::leak(vec![Page::zeroed(); frames].into_boxed_slice());
        FramePool::new(PhysAddr(0x8000_0000), pages)
    }

    #[test]
    fn allocates_zeroed_frames_until_exhausted() {
        let mut pool = pool(3);
        let a = pool.alloc_page().unwrap();
        pool.page_mut(a).0[7] = 0xAA;
        let b = pool.alloc_page().unwrap();
        let c = pool.alloc_page().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(pool.alloc_page(), None);
        assert_eq!(pool.free_frames(), 0);

        pool.free_page(a);
        let again = pool.alloc_page().unwrap();
        assert_eq!(again, a);
        assert_eq!(pool.page(again).0[7], 0, "recycled frame must be zeroed");
    }

    #[test]
    fn tracks_allocation_state() {
        let mut pool = pool(4);
        let a = pool.alloc_page().unwrap();
        assert!(pool.is_allocated(a));
        pool.free_page(a);
        assert!(!pool.is_allocated(a));
        assert_eq!(pool.free_frames(), pool.total_frames());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut pool = pool(2);
        let a = pool.alloc_page().unwrap();
        pool.free_page(a);
        pool.free_page(a);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn foreign_address_is_fatal() {
        let pool = pool(2);
        pool.page(PhysAddr(0x1000));
    }
}
