use alloc::vec::Vec;
use bit_field::BitField;
use bitflags::bitflags;
use core::fmt;

use super::{FrameAllocator, PhysAddr, VirtAddr};
use crate::config::{PAGE_SIZE, SATP_MODE_SV39};

bitflags! {
    /// Sv39 page-table entry flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

impl PteFlags {
    /// A valid entry with any of R/W/X set maps a page; otherwise it points
    /// at the next level table.
    pub fn is_leaf(self) -> bool {
        self.intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

/// One bit below the Sv39 limit, so user addresses never need sign extension.
pub const MAX_VA: u64 = 1 << 38;

const ENTRIES: usize = PAGE_SIZE / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfFrames,
    AlreadyMapped(VirtAddr),
    NotMapped(VirtAddr),
    OutOfRange(VirtAddr),
}

impl VmError {
    /// Mapper failures leave a half-built address space behind; the kernel
    /// cannot continue from any of them.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "out of frames for page tables"),
            VmError::AlreadyMapped(va) => write!(f, "{:#x} is already mapped", va),
            VmError::NotMapped(va) => write!(f, "{:#x} is not mapped", va),
            VmError::OutOfRange(va) => write!(f, "{:#x} is outside the user address range", va),
        }
    }
}

/// Result of a successful page-table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub pa: PhysAddr,
    pub flags: PteFlags,
}

/// Virtual-memory table component consumed by the process core.
///
/// Page tables are identified by the physical address of their root page.
/// Table pages themselves are taken from, and returned to, `frames`.
pub trait AddressMapper {
    /// Map `[va, va + len)` onto consecutive frames starting at `pa`.
    fn map<F: FrameAllocator>(
        &self,
        frames: &mut F,
        root: PhysAddr,
        va: VirtAddr,
        len: usize,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> Result<(), VmError>;

    /// Remove the mappings of `[va, va + len)`, optionally freeing the
    /// frames behind them.
    fn unmap<F: FrameAllocator>(
        &self,
        frames: &mut F,
        root: PhysAddr,
        va: VirtAddr,
        len: usize,
        free_backing: bool,
    ) -> Result<(), VmError>;

    fn translate<F: FrameAllocator>(&self, frames: &F, root: PhysAddr, va: VirtAddr) -> Option<Translation>;

    /// Free every table page reachable from `root`, including `root`.
    fn destroy<F: FrameAllocator>(&self, frames: &mut F, root: PhysAddr);

    /// Translation-root register value that activates `root`.
    fn satp(&self, root: PhysAddr) -> u64;
}

/// Three-level RISC-V Sv39 page tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sv39;

fn pte_to_pa(pte: u64) -> PhysAddr {
    PhysAddr(pte.get_bits(10..54) << 12)
}

fn pa_to_pte(pa: PhysAddr) -> u64 {
    let mut pte = 0u64;
    pte.set_bits(10..54, pa.0 >> 12);
    pte
}

fn vpn(va: VirtAddr, level: usize) -> usize {
    let shift = 12 + 9 * level;
    va.0.get_bits(shift..shift + 9) as usize
}

/// Build the `satp` value that activates the table rooted at `root`.
pub fn make_satp(root: PhysAddr) -> u64 {
    let mut satp = 0u64;
    satp.set_bits(60..64, SATP_MODE_SV39);
    satp.set_bits(0..44, root.0 >> 12);
    satp
}

fn check_range(va: VirtAddr, len: usize) -> Result<(VirtAddr, usize), VmError> {
    let end = va.checked_add(len as u64).ok_or(VmError::OutOfRange(va))?;
    if end.0 > MAX_VA {
        return Err(VmError::OutOfRange(va));
    }
    let first = va.align_down();
    let pages = ((end.0 - first.0) as usize + PAGE_SIZE - 1) / PAGE_SIZE;
    Ok((first, pages))
}

impl Sv39 {
    /// Locate the level-0 entry for `va` without creating tables.
    /// Returns the table holding it and the entry's byte offset.
    fn walk<F: FrameAllocator>(&self, frames: &F, root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, usize)> {
        let mut table = root;
        for level in [2, 1] {
            let pte = frames.page(table).read_u64(vpn(va, level) * 8);
            let flags = PteFlags::from_bits_truncate(pte);
            if !flags.contains(PteFlags::V) || flags.is_leaf() {
                return None;
            }
            table = pte_to_pa(pte);
        }
        Some((table, vpn(va, 0) * 8))
    }

    fn walk_alloc<F: FrameAllocator>(
        &self,
        frames: &mut F,
        root: PhysAddr,
        va: VirtAddr,
    ) -> Result<(PhysAddr, usize), VmError> {
        let mut table = root;
        for level in [2, 1] {
            let offset = vpn(va, level) * 8;
            let pte = frames.page(table).read_u64(offset);
            let flags = PteFlags::from_bits_truncate(pte);
            if flags.contains(PteFlags::V) {
                if flags.is_leaf() {
                    // Superpages are never created for user space.
                    return Err(VmError::AlreadyMapped(va));
                }
                table = pte_to_pa(pte);
            } else {
                let next = frames.alloc_page().ok_or(VmError::OutOfFrames)?;
                frames
                    .page_mut(table)
                    .write_u64(offset, pa_to_pte(next) | PteFlags::V.bits());
                table = next;
            }
        }
        Ok((table, vpn(va, 0) * 8))
    }

    /// Every leaf mapping under `root`, in ascending virtual address order.
    pub fn leaves<F: FrameAllocator>(&self, frames: &F, root: PhysAddr) -> Vec<(VirtAddr, Translation)> {
        let mut out = Vec::new();
        self.collect_leaves(frames, root, 2, 0, &mut out);
        out
    }

    fn collect_leaves<F: FrameAllocator>(
        &self,
        frames: &F,
        table: PhysAddr,
        level: usize,
        prefix: u64,
        out: &mut Vec<(VirtAddr, Translation)>,
    ) {
        for index in 0..ENTRIES {
            let pte = frames.page(table).read_u64(index * 8);
            let flags = PteFlags::from_bits_truncate(pte);
            if !flags.contains(PteFlags::V) {
                continue;
            }
            let va = prefix | ((index as u64) << (12 + 9 * level));
            if flags.is_leaf() {
                out.push((VirtAddr(va), Translation { pa: pte_to_pa(pte), flags }));
            } else if level > 0 {
                self.collect_leaves(frames, pte_to_pa(pte), level - 1, va, out);
            }
        }
    }

    fn free_table<F: FrameAllocator>(&self, frames: &mut F, table: PhysAddr, level: usize) {
        for index in 0..ENTRIES {
            let pte = frames.page(table).read_u64(index * 8);
            let flags = PteFlags::from_bits_truncate(pte);
            if !flags.contains(PteFlags::V) {
                continue;
            }
            if level > 0 && !flags.is_leaf() {
                self.free_table(frames, pte_to_pa(pte), level - 1);
            } else {
                crate::log_warn!(
                    "sv39: leaf {:#x} still mapped while destroying table {:#x}",
                    pte_to_pa(pte),
                    table
                );
            }
        }
        frames.free_page(table);
    }
}

impl AddressMapper for Sv39 {
    fn map<F: FrameAllocator>(
        &self,
        frames: &mut F,
        root: PhysAddr,
        va: VirtAddr,
        len: usize,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> Result<(), VmError> {
        let (first, pages) = check_range(va, len)?;
        let pa = pa.align_down();
        for i in 0..pages {
            let page_va = first.page(i);
            let (table, offset) = self.walk_alloc(frames, root, page_va)?;
            let slot = frames.page_mut(table);
            if PteFlags::from_bits_truncate(slot.read_u64(offset)).contains(PteFlags::V) {
                return Err(VmError::AlreadyMapped(page_va));
            }
            slot.write_u64(offset, pa_to_pte(pa.page(i)) | (perm | PteFlags::V).bits());
        }
        Ok(())
    }

    fn unmap<F: FrameAllocator>(
        &self,
        frames: &mut F,
        root: PhysAddr,
        va: VirtAddr,
        len: usize,
        free_backing: bool,
    ) -> Result<(), VmError> {
        let (first, pages) = check_range(va, len)?;
        for i in 0..pages {
            let page_va = first.page(i);
            let (table, offset) = self
                .walk(&*frames, root, page_va)
                .ok_or(VmError::NotMapped(page_va))?;
            let pte = frames.page(table).read_u64(offset);
            if !PteFlags::from_bits_truncate(pte).contains(PteFlags::V) {
                return Err(VmError::NotMapped(page_va));
            }
            frames.page_mut(table).write_u64(offset, 0);
            if free_backing {
                frames.free_page(pte_to_pa(pte));
            }
        }
        Ok(())
    }

    fn translate<F: FrameAllocator>(&self, frames: &F, root: PhysAddr, va: VirtAddr) -> Option<Translation> {
        if va.0 >= MAX_VA {
            return None;
        }
        let (table, offset) = self.walk(frames, root, va)?;
        let pte = frames.page(table).read_u64(offset);
        let flags = PteFlags::from_bits_truncate(pte);
        if !flags.contains(PteFlags::V) {
            return None;
        }
        Some(Translation {
            pa: PhysAddr(pte_to_pa(pte).0 + va.page_offset() as u64),
            flags,
        })
    }

    fn destroy<F: FrameAllocator>(&self, frames: &mut F, root: PhysAddr) {
        self.free_table(frames, root, 2);
    }

    fn satp(&self, root: PhysAddr) -> u64 {
        make_satp(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FramePool, Page};
    use alloc::boxed::Box;
    use alloc::vec;

    fn pool(frames: usize) -> FramePool {
        let pages = Box::leak(vec![Page::zeroed(); frames].into_boxed_slice());
        FramePool::new(PhysAddr(0x8000_0000), pages)
    }

    const RW: PteFlags = PteFlags::R.union(PteFlags::W).union(PteFlags::U);

    #[test]
    fn map_translate_unmap() {
        let mut frames = pool(16);
        let root = frames.alloc_page().unwrap();
        let data = frames.alloc_page().unwrap();
        let va = VirtAddr(0x7fff_e000);

        Sv39.map(&mut frames, root, va, PAGE_SIZE, data, RW).unwrap();
        let t = Sv39.translate(&frames, root, VirtAddr(va.0 + 0x10)).unwrap();
        assert_eq!(t.pa, PhysAddr(data.0 + 0x10));
        assert!(t.flags.contains(PteFlags::V | RW));

        assert_eq!(
            Sv39.map(&mut frames, root, va, PAGE_SIZE, data, RW),
            Err(VmError::AlreadyMapped(va))
        );

        let before = frames.free_frames();
        Sv39.unmap(&mut frames, root, va, PAGE_SIZE, true).unwrap();
        assert_eq!(frames.free_frames(), before + 1);
        assert_eq!(Sv39.translate(&frames, root, va), None);
        assert_eq!(
            Sv39.unmap(&mut frames, root, va, PAGE_SIZE, false),
            Err(VmError::NotMapped(va))
        );
    }

    #[test]
    fn multi_page_ranges_use_consecutive_frames() {
        let mut frames = pool(16);
        let root = frames.alloc_page().unwrap();
        let base = PhysAddr(0x8000_8000);
        Sv39.map(&mut frames, root, VirtAddr(0x1000), 2 * PAGE_SIZE, base, RW).unwrap();
        let leaves = Sv39.leaves(&frames, root);
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].0, VirtAddr(0x1000));
        assert_eq!(leaves[1].1.pa, PhysAddr(0x8000_9000));
        Sv39.unmap(&mut frames, root, VirtAddr(0x1000), 2 * PAGE_SIZE, false).unwrap();
        assert!(Sv39.leaves(&frames, root).is_empty());
    }

    #[test]
    fn destroy_returns_every_table_page() {
        let mut frames = pool(16);
        let baseline = frames.free_frames();
        let root = frames.alloc_page().unwrap();
        let data = frames.alloc_page().unwrap();
        Sv39.map(&mut frames, root, VirtAddr(0x4000), PAGE_SIZE, data, RW).unwrap();
        Sv39.map(&mut frames, root, VirtAddr(0x7fff_e000), PAGE_SIZE, data, RW).unwrap();
        Sv39.unmap(&mut frames, root, VirtAddr(0x4000), PAGE_SIZE, false).unwrap();
        Sv39.unmap(&mut frames, root, VirtAddr(0x7fff_e000), PAGE_SIZE, true).unwrap();
        Sv39.destroy(&mut frames, root);
        assert_eq!(frames.free_frames(), baseline);
    }

    #[test]
    fn rejects_addresses_beyond_sv39() {
        let mut frames = pool(4);
        let root = frames.alloc_page().unwrap();
        let va = VirtAddr(MAX_VA);
        assert_eq!(
            Sv39.map(&mut frames, root, va, PAGE_SIZE, PhysAddr(0x8000_0000), RW),
            Err(VmError::OutOfRange(va))
        );
        assert_eq!(Sv39.translate(&frames, root, va), None);
    }

    #[test]
    fn satp_selects_sv39_and_root_ppn() {
        let satp = make_satp(PhysAddr(0x8020_0000));
        assert_eq!(satp >> 60, 8);
        assert_eq!(satp & ((1 << 44) - 1), 0x8020_0000 >> 12);
    }
}
