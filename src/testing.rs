//! Host-side fixtures: a small machine and a synthetic image builder.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::loader::elf::SegmentFlags;
use crate::memory::paging::make_satp;
use crate::memory::{FrameAllocator, FramePool, Page, PhysAddr, SharedFrames, Sv39};
use crate::process::{AddressSpace, ProcessTable};
use crate::scheduler::KernelLayout;

pub const RAM_BASE: PhysAddr = PhysAddr(0x8000_0000);

/// Frames, mapper and layout for driving the core without a process table.
pub struct Machine {
    pub frames: FramePool,
    pub mapper: Sv39,
    pub layout: KernelLayout,
    pub shared: SharedFrames,
}

fn leaked_pool(frames: usize) -> FramePool {
    let pages = Box::leak(vec![Page::zeroed(); frames].into_boxed_slice());
    FramePool::new(RAM_BASE, pages)
}

/// Take one frame to stand in for the kernel's trap vector text.
fn layout_in(frames: &mut FramePool) -> KernelLayout {
    let trap_vector = frames.alloc_page().expect("trap vector frame");
    KernelLayout {
        trap_vector,
        trap_entry: trap_vector.0,
        trap_handler: 0x8020_0400,
        kernel_satp: make_satp(PhysAddr(0x8010_0000)),
    }
}

impl Machine {
    pub fn new(frame_count: usize) -> Self {
        let mut frames = leaked_pool(frame_count);
        let layout = layout_in(&mut frames);
        Machine {
            frames,
            mapper: Sv39,
            layout,
            shared: SharedFrames::new(),
        }
    }

    pub fn build_space(&mut self) -> AddressSpace {
        AddressSpace::build(&mut self.frames, &self.mapper, &self.layout).expect("build address space")
    }
}

/// A process table over `frame_count` frames with `capacity` slots.
pub fn table(frame_count: usize, capacity: usize) -> ProcessTable<FramePool> {
    let mut frames = leaked_pool(frame_count);
    let layout = layout_in(&mut frames);
    ProcessTable::new(frames, Sv39, layout, capacity)
}

struct ImageSegment {
    vaddr: u64,
    flags: SegmentFlags,
    bytes: Vec<u8>,
    memsz: u64,
}

/// Builds little-endian RISC-V ELF64 executables.
pub struct ImageBuilder {
    entry: u64,
    segments: Vec<ImageSegment>,
}

impl ImageBuilder {
    pub fn new(entry: u64) -> Self {
        ImageBuilder {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn code(self, vaddr: u64, bytes: &[u8]) -> Self {
        self.segment(vaddr, SegmentFlags::R | SegmentFlags::X, bytes, bytes.len() as u64)
    }

    pub fn data(self, vaddr: u64, bytes: &[u8]) -> Self {
        self.segment(vaddr, SegmentFlags::R | SegmentFlags::W, bytes, bytes.len() as u64)
    }

    pub fn segment(mut self, vaddr: u64, flags: SegmentFlags, bytes: &[u8], memsz: u64) -> Self {
        self.segments.push(ImageSegment {
            vaddr,
            flags,
            bytes: bytes.to_vec(),
            memsz,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        let mut out = vec![0u8; EHDR + PHDR * self.segments.len()];

        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little endian
        out[6] = 1;
        out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out[18..20].copy_from_slice(&243u16.to_le_bytes()); // EM_RISCV
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&(EHDR as u64).to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR as u16).to_le_bytes());
        out[54..56].copy_from_slice(&(PHDR as u16).to_le_bytes());
        out[56..58].copy_from_slice(&(self.segments.len() as u16).to_le_bytes());

        for (index, seg) in self.segments.iter().enumerate() {
            let offset = out.len() as u64;
            out.extend_from_slice(&seg.bytes);
            let ph = EHDR + index * PHDR;
            out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            out[ph + 4..ph + 8].copy_from_slice(&seg.flags.bits().to_le_bytes());
            out[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
            out[ph + 16..ph + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[ph + 24..ph + 32].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[ph + 32..ph + 40].copy_from_slice(&(seg.bytes.len() as u64).to_le_bytes());
            out[ph + 40..ph + 48].copy_from_slice(&seg.memsz.to_le_bytes());
            out[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        }
        out
    }
}

/// Two-segment program: one code page at 0x1000, one data page at 0x2000.
pub fn hello_image() -> Vec<u8> {
    ImageBuilder::new(0x1000)
        .code(0x1000, &[0x13, 0x05, 0x10, 0x00, 0x73, 0x00, 0x00, 0x00])
        .data(0x2000, b"hello\0")
        .build()
}
