//! Operations that create, duplicate and replace processes.

use alloc::vec::Vec;

use super::error::{ProcError, ProcResult};
use super::pcb::{Pid, ProcessState};
use super::segment::SegmentKind;
use super::space::{AddressSpace, USER_STACK_BASE};
use super::ProcessTable;
use crate::config::{MAX_CMDLINE_ARGS, USER_STACK_TOP};
use crate::loader::{ElfLoader, ImageSource, LoadedImage};
use crate::memory::{AddressMapper, FrameAllocator, PteFlags, VirtAddr, VmError};
use crate::scheduler::{Scheduler, TrapFrame};

const LEAF_PERMS: PteFlags = PteFlags::R
    .union(PteFlags::W)
    .union(PteFlags::X)
    .union(PteFlags::U);

/// Where each argument string lands on a fresh user stack.
struct ArgvLayout {
    /// Stack address of each string, in argv order.
    strings: Vec<u64>,
    /// Final `sp`: the pointer array, NULL terminated.
    sp: u64,
}

impl ArgvLayout {
    /// Strings are copied downward from the stack top, NUL terminated and
    /// 8-byte aligned, then the pointer array goes below them on a 16-byte
    /// boundary so that `sp[i] == argv[i]` and `sp[argc] == 0`.
    fn plan(argv: &[&str]) -> ProcResult<ArgvLayout> {
        if argv.len() > MAX_CMDLINE_ARGS {
            return Err(ProcError::ArgumentsTooLarge);
        }
        let mut cursor = USER_STACK_TOP;
        let mut strings = Vec::with_capacity(argv.len());
        for arg in argv {
            let size = ((arg.len() + 1 + 7) & !7) as u64;
            cursor = cursor
                .checked_sub(size)
                .filter(|&at| at >= USER_STACK_BASE.0)
                .ok_or(ProcError::ArgumentsTooLarge)?;
            strings.push(cursor);
        }
        let table = 8 * (argv.len() as u64 + 1);
        let sp = cursor
            .checked_sub(table)
            .map(|at| at & !15)
            .filter(|&at| at >= USER_STACK_BASE.0)
            .ok_or(ProcError::ArgumentsTooLarge)?;
        Ok(ArgvLayout { strings, sp })
    }
}

impl<F: FrameAllocator, M: AddressMapper> ProcessTable<F, M> {
    /// Duplicate `parent`. The child gets a copy of the trap frame (with
    /// `a0 = 0`), the stack and every DATA page, and shares the parent's
    /// CODE frames. Returns the child's pid; the child is queued READY.
    pub fn fork<S: Scheduler>(&mut self, parent: Pid, sched: &mut S) -> ProcResult<Pid> {
        self.live(parent)?;
        let child = self.allocate()?;
        if let Err(err) = self.copy_address_space(parent, child) {
            self.discard(child);
            return Err(err);
        }

        let heap_top = self.get(parent)?.heap_top;
        let record = self.get_mut(child)?;
        record.parent = Some(parent);
        record.heap_top = heap_top;
        self.set_ready(child, sched)?;
        crate::log_info!("fork: process {} created child {}", parent, child);
        Ok(child)
    }

    fn copy_address_space(&mut self, parent: Pid, child: Pid) -> ProcResult<()> {
        let (parent_root, parent_tf, segments) = {
            let space = self.space(parent)?;
            (space.root, space.trap_frame, space.segments.clone())
        };

        let ProcessTable {
            procs,
            frames,
            mapper,
            shared,
            ..
        } = self;
        let mapper = &*mapper;
        let child_space = procs[child.0]
            .space
            .as_mut()
            .ok_or(ProcError::NoSuchProcess(child))?;

        for segment in segments.iter() {
            match segment.kind {
                SegmentKind::Context => {
                    let saved = *TrapFrame::in_page(frames.page(parent_tf));
                    let tf = child_space.trap_frame_mut(frames);
                    *tf = saved;
                    tf.regs.a0 = 0;
                }
                SegmentKind::Stack => {
                    let src = mapper
                        .translate(&*frames, parent_root, segment.base)
                        .ok_or(ProcError::Map(VmError::NotMapped(segment.base)))?;
                    let dst = child_space
                        .stack_frame(&*frames, mapper)
                        .ok_or(ProcError::Map(VmError::NotMapped(segment.base)))?;
                    let contents = frames.page(src.pa).clone();
                    *frames.page_mut(dst) = contents;
                }
                SegmentKind::Code => {
                    for page in 0..segment.pages {
                        let va = segment.base.page(page);
                        let src = mapper
                            .translate(&*frames, parent_root, va)
                            .ok_or(ProcError::Map(VmError::NotMapped(va)))?;
                        child_space.map_segment(frames, mapper, va, src.pa, src.flags & LEAF_PERMS, SegmentKind::Code)?;
                        shared.acquire(src.pa);
                        crate::log_info!("fork: sharing code page {:#x} -> {:#x}", va, src.pa);
                    }
                }
                SegmentKind::Data => {
                    for page in 0..segment.pages {
                        let va = segment.base.page(page);
                        let src = mapper
                            .translate(&*frames, parent_root, va)
                            .ok_or(ProcError::Map(VmError::NotMapped(va)))?;
                        let copy = frames.alloc_page().ok_or(ProcError::OutOfMemory)?;
                        let contents = frames.page(src.pa).clone();
                        *frames.page_mut(copy) = contents;
                        if let Err(err) =
                            child_space.map_segment(frames, mapper, va, copy, src.flags & LEAF_PERMS, SegmentKind::Data)
                        {
                            frames.free_page(copy);
                            return Err(err);
                        }
                    }
                }
                // Installed by the builder.
                SegmentKind::System => {}
            }
        }
        Ok(())
    }

    /// Create a process running `image` with no parent and queue it.
    pub fn spawn<S: Scheduler, I: ImageSource + ?Sized>(&mut self, image: &I, sched: &mut S) -> ProcResult<Pid> {
        let loader = ElfLoader::init(image)?;
        loader.loadable_segments()?;
        let pid = self.allocate()?;

        let ProcessTable {
            procs,
            frames,
            mapper,
            shared,
            ..
        } = self;
        let space = procs[pid.0].space.as_mut().ok_or(ProcError::NoSuchProcess(pid))?;
        if let Err(err) = loader.load(frames, &*mapper, space, shared) {
            self.discard(pid);
            return Err(err.into());
        }

        self.set_ready(pid, sched)?;
        crate::log_info!("spawn: process {} entry {:#x}", pid, loader.entry());
        Ok(pid)
    }

    /// Replace the program running as `pid` with `image`.
    ///
    /// The new image is validated and loaded into a freshly built address
    /// space first; only once that has fully succeeded is it swapped in and
    /// the old space torn down. On error the process is left exactly as it
    /// was. The pid, parent, kernel stack and tick counters carry over.
    pub fn exec<I: ImageSource + ?Sized>(&mut self, pid: Pid, image: &I, argv: &[&str]) -> ProcResult<LoadedImage> {
        self.live(pid)?;
        let args = ArgvLayout::plan(argv)?;
        let loader = ElfLoader::init(image)?;
        loader.loadable_segments()?;

        let mut staged = AddressSpace::build(&mut self.frames, &self.mapper, &self.layout)?;
        let result = Self::write_argv(&mut self.frames, &self.mapper, &staged, &args, argv)
            .and_then(|()| {
                loader
                    .load(&mut self.frames, &self.mapper, &mut staged, &mut self.shared)
                    .map_err(ProcError::from)
            });
        let loaded = match result {
            Ok(loaded) => loaded,
            Err(err) => {
                staged.teardown(&mut self.frames, &self.mapper, &mut self.shared);
                return Err(err);
            }
        };

        let record = self.get_mut(pid)?;
        let old = record.space.replace(staged);
        record.heap_top = VirtAddr(crate::config::USER_FREE_ADDRESS_START);
        if let Some(old) = old {
            old.teardown(&mut self.frames, &self.mapper, &mut self.shared);
        }
        crate::log_info!("exec: process {} now runs image with entry {:#x}", pid, loaded.entry);
        Ok(loaded)
    }

    fn write_argv(frames: &mut F, mapper: &M, space: &AddressSpace, args: &ArgvLayout, argv: &[&str]) -> ProcResult<()> {
        let stack = space
            .stack_frame(&*frames, mapper)
            .ok_or(ProcError::Map(VmError::NotMapped(USER_STACK_BASE)))?;
        let offset = |va: u64| (va - USER_STACK_BASE.0) as usize;

        let page = frames.page_mut(stack);
        for (arg, &at) in argv.iter().zip(&args.strings) {
            let start = offset(at);
            page.0[start..start + arg.len()].copy_from_slice(arg.as_bytes());
            page.0[start + arg.len()] = 0;
        }
        for (index, &at) in args.strings.iter().enumerate() {
            page.write_u64(offset(args.sp) + 8 * index, at);
        }
        page.write_u64(offset(args.sp) + 8 * args.strings.len(), 0);

        let tf = space.trap_frame_mut(frames);
        tf.regs.sp = args.sp;
        tf.regs.a0 = argv.len() as u64;
        tf.regs.a1 = args.sp;
        Ok(())
    }

    /// Give up the hart: `pid` goes back to READY at the tail of the queue.
    pub fn yield_current<S: Scheduler>(&mut self, pid: Pid, sched: &mut S) -> ProcResult<()> {
        let status = self.live(pid)?.status;
        if status == ProcessState::Blocked {
            return Err(ProcError::InvalidState { pid, status });
        }
        self.set_ready(pid, sched)
    }

    /// Map one fresh zeroed page at the process's heap cursor.
    pub fn alloc_user_page(&mut self, pid: Pid) -> ProcResult<VirtAddr> {
        self.live(pid)?;
        let ProcessTable {
            procs,
            frames,
            mapper,
            ..
        } = self;
        let mapper = &*mapper;
        let record = &mut procs[pid.0];
        let va = record.heap_top;
        let space = record.space.as_mut().ok_or(ProcError::NoSuchProcess(pid))?;

        let pa = frames.alloc_page().ok_or(ProcError::OutOfMemory)?;
        if let Err(err) = space.map_segment(
            frames,
            mapper,
            va,
            pa,
            PteFlags::R | PteFlags::W | PteFlags::U,
            SegmentKind::Data,
        ) {
            frames.free_page(pa);
            return Err(err);
        }
        record.heap_top = va.page(1);
        Ok(va)
    }

    /// Unmap and free a page previously handed out as a one-page DATA
    /// segment.
    pub fn free_user_page(&mut self, pid: Pid, va: VirtAddr) -> ProcResult<()> {
        self.live(pid)?;
        let ProcessTable {
            procs,
            frames,
            mapper,
            shared,
            ..
        } = self;
        let mapper = &*mapper;
        let space = procs[pid.0].space.as_mut().ok_or(ProcError::NoSuchProcess(pid))?;
        let index = space.segments.find(va).ok_or(ProcError::BadAddress(va))?;
        let segment = *space.segments.get(index).ok_or(ProcError::BadAddress(va))?;
        if segment.kind != SegmentKind::Data || segment.pages != 1 {
            return Err(ProcError::BadAddress(va));
        }
        space.release_page(frames, mapper, shared, segment.kind, segment.base);
        space.segments.remove(index);
        Ok(())
    }
}
