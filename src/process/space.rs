use alloc::boxed::Box;

use super::error::{ProcError, ProcResult};
use super::segment::{Reclaim, Segment, SegmentKind, SegmentTable};
use crate::config::{PAGE_SIZE, USER_STACK_TOP};
use crate::memory::{AddressMapper, FrameAllocator, PhysAddr, PteFlags, SharedFrames, VirtAddr};
use crate::scheduler::{KernelLayout, TrapFrame};

/// Base of the one-page user stack.
pub const USER_STACK_BASE: VirtAddr = VirtAddr(USER_STACK_TOP - PAGE_SIZE as u64);

/// A process's virtual address space: its page table, its trap frame page
/// and the segment table describing every user-visible mapping.
#[derive(Debug)]
pub struct AddressSpace {
    pub root: PhysAddr,
    pub trap_frame: PhysAddr,
    pub segments: Box<SegmentTable>,
}

impl AddressSpace {
    /// Allocate a fresh page table and trap frame and install the three
    /// mappings every process has: STACK, CONTEXT and SYSTEM, in table
    /// slots 0, 1 and 2. Nothing is leaked on failure.
    pub fn build<F: FrameAllocator, M: AddressMapper>(
        frames: &mut F,
        mapper: &M,
        layout: &KernelLayout,
    ) -> ProcResult<AddressSpace> {
        let root = frames.alloc_page().ok_or(ProcError::OutOfMemory)?;
        let trap_frame = match frames.alloc_page() {
            Some(pa) => pa,
            None => {
                mapper.destroy(frames, root);
                return Err(ProcError::OutOfMemory);
            }
        };
        let mut space = AddressSpace {
            root,
            trap_frame,
            segments: Box::new(SegmentTable::new()),
        };
        match space.install_skeleton(frames, mapper, layout) {
            Ok(()) => Ok(space),
            Err(err) => {
                space.teardown(frames, mapper, &mut SharedFrames::new());
                Err(err)
            }
        }
    }

    fn install_skeleton<F: FrameAllocator, M: AddressMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        layout: &KernelLayout,
    ) -> ProcResult<()> {
        let stack = frames.alloc_page().ok_or(ProcError::OutOfMemory)?;
        if let Err(err) = self.map_segment(
            frames,
            mapper,
            USER_STACK_BASE,
            stack,
            PteFlags::R | PteFlags::W | PteFlags::U,
            SegmentKind::Stack,
        ) {
            frames.free_page(stack);
            return Err(err);
        }

        // Identity-mapped so the trap vector reaches it under either satp.
        let trap_frame = self.trap_frame;
        self.map_segment(
            frames,
            mapper,
            VirtAddr(trap_frame.0),
            trap_frame,
            PteFlags::R | PteFlags::W,
            SegmentKind::Context,
        )?;

        self.map_segment(
            frames,
            mapper,
            VirtAddr(layout.trap_vector.0),
            layout.trap_vector,
            PteFlags::R | PteFlags::X,
            SegmentKind::System,
        )?;

        self.trap_frame_mut(frames).regs.sp = USER_STACK_TOP;
        Ok(())
    }

    /// Map one page at `va` onto `pa` and describe it in the segment table.
    /// Either both happen or neither does.
    pub fn map_segment<F: FrameAllocator, M: AddressMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PteFlags,
        kind: SegmentKind,
    ) -> ProcResult<()> {
        if self.segments.is_full() {
            return Err(ProcError::SegmentTableFull);
        }
        mapper.map(frames, self.root, va, PAGE_SIZE, pa, perm)?;
        self.segments.push(Segment::new(va.align_down(), 1, kind))?;
        Ok(())
    }

    pub fn trap_frame<'a, F: FrameAllocator>(&self, frames: &'a F) -> &'a TrapFrame {
        TrapFrame::in_page(frames.page(self.trap_frame))
    }

    pub fn trap_frame_mut<'a, F: FrameAllocator>(&self, frames: &'a mut F) -> &'a mut TrapFrame {
        TrapFrame::in_page_mut(frames.page_mut(self.trap_frame))
    }

    /// Physical frame behind `va`.
    pub fn frame_of<F: FrameAllocator, M: AddressMapper>(
        &self,
        frames: &F,
        mapper: &M,
        va: VirtAddr,
    ) -> Option<PhysAddr> {
        mapper
            .translate(frames, self.root, va.align_down())
            .map(|translation| translation.pa)
    }

    pub fn stack_frame<F: FrameAllocator, M: AddressMapper>(&self, frames: &F, mapper: &M) -> Option<PhysAddr> {
        self.frame_of(frames, mapper, USER_STACK_BASE)
    }

    /// Unmap one page of a segment and give its frame back per the kind's
    /// reclaim policy.
    pub fn release_page<F: FrameAllocator, M: AddressMapper>(
        &self,
        frames: &mut F,
        mapper: &M,
        shared: &mut SharedFrames,
        kind: SegmentKind,
        va: VirtAddr,
    ) {
        // Every segment page is mapped; anything else is a corrupted space.
        let pa = match self.frame_of(&*frames, mapper, va) {
            Some(pa) => pa,
            None => panic!("space: {} page {:#x} has no mapping", kind, va),
        };
        let result = match kind.reclaim() {
            Reclaim::UnmapAndFree => mapper.unmap(frames, self.root, va, PAGE_SIZE, true),
            Reclaim::ReleaseShared => {
                let unmapped = mapper.unmap(frames, self.root, va, PAGE_SIZE, false);
                if unmapped.is_ok() && shared.release(pa) {
                    frames.free_page(pa);
                }
                unmapped
            }
            Reclaim::UnmapOnly => mapper.unmap(frames, self.root, va, PAGE_SIZE, false),
        };
        if let Err(err) = result {
            panic!("space: unmapping {} page {:#x}: {}", kind, va, err);
        }
    }

    /// Release every segment per its kind, then the page table itself.
    pub fn teardown<F: FrameAllocator, M: AddressMapper>(self, frames: &mut F, mapper: &M, shared: &mut SharedFrames) {
        for segment in self.segments.iter() {
            for page in 0..segment.pages {
                self.release_page(frames, mapper, shared, segment.kind, segment.base.page(page));
            }
        }
        // A space that failed before CONTEXT was mapped still owns the frame.
        if self.segments.count(SegmentKind::Context) == 0 {
            frames.free_page(self.trap_frame);
        }
        mapper.destroy(frames, self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Machine;

    #[test]
    fn teardown_returns_every_frame() {
        let mut machine = Machine::new(32);
        let baseline = machine.frames.free_frames();
        let space = machine.build_space();
        assert_eq!(space.segments.len(), 3);
        space.teardown(&mut machine.frames, &machine.mapper, &mut machine.shared);
        assert_eq!(machine.frames.free_frames(), baseline);
    }

    #[test]
    #[should_panic(expected = "has no mapping")]
    fn teardown_halts_on_a_segment_without_mapping() {
        let mut machine = Machine::new(32);
        let space = machine.build_space();
        machine
            .mapper
            .unmap(&mut machine.frames, space.root, USER_STACK_BASE, PAGE_SIZE, false)
            .unwrap();
        space.teardown(&mut machine.frames, &machine.mapper, &mut machine.shared);
    }
}
