use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

use super::image::ImageSource;
use crate::config::PAGE_SIZE;
use crate::memory::{AddressMapper, FrameAllocator, PteFlags, SharedFrames, VirtAddr, VmError};
use crate::process::space::AddressSpace;
use crate::process::{ProcError, SegmentKind};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8    = 2;
const ELFDATA2LSB: u8   = 1;
const EM_RISCV: u16     = 243;
const PT_LOAD: u32      = 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

bitflags! {
    /// Program header `p_flags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    fn parse(data: &[u8; EHDR_SIZE]) -> Result<Self, ElfError> {
        if data[0..4] != ELF_MAGIC { return Err(ElfError::NotAnImage); }
        if data[4] != ELFCLASS64 { return Err(ElfError::UnsupportedArch); }
        if data[5] != ELFDATA2LSB { return Err(ElfError::UnsupportedArch); }

        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_machine != EM_RISCV { return Err(ElfError::UnsupportedArch); }

        let header = ElfHeader {
            entry: read_u64(data, 24),
            phoff: read_u64(data, 32),
            phentsize: u16::from_le_bytes([data[54], data[55]]),
            phnum: u16::from_le_bytes([data[56], data[57]]),
        };
        if header.phnum > 0 && (header.phentsize as usize) < PHDR_SIZE {
            return Err(ElfError::Malformed);
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    fn parse(data: &[u8; PHDR_SIZE]) -> Self {
        ProgramHeader {
            p_type: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            flags: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            offset: read_u64(data, 8),
            vaddr: read_u64(data, 16),
            filesz: read_u64(data, 32),
            memsz: read_u64(data, 40),
        }
    }

    /// CODE for exactly R|X, DATA for exactly R|W.
    pub fn kind(&self) -> Result<SegmentKind, ElfError> {
        let flags = SegmentFlags::from_bits(self.flags).ok_or(ElfError::UnknownSegment(self.flags))?;
        if flags == SegmentFlags::R | SegmentFlags::X {
            Ok(SegmentKind::Code)
        } else if flags == SegmentFlags::R | SegmentFlags::W {
            Ok(SegmentKind::Data)
        } else {
            Err(ElfError::UnknownSegment(self.flags))
        }
    }

    /// Page permissions for the segment's mapping.
    pub fn permissions(&self) -> PteFlags {
        let flags = SegmentFlags::from_bits_truncate(self.flags);
        let mut perm = PteFlags::U;
        if flags.contains(SegmentFlags::R) { perm |= PteFlags::R; }
        if flags.contains(SegmentFlags::W) { perm |= PteFlags::W; }
        if flags.contains(SegmentFlags::X) { perm |= PteFlags::X; }
        perm
    }
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

// ══════════════════════════════════════════════════════════════
//  ElfError
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    NotFound,
    NotAnImage,
    Io,
    UnsupportedArch,
    Malformed,
    SegmentTooLarge,
    UnknownSegment(u32),
    OutOfMemory,
    Map(VmError),
    SegmentTableFull,
}

impl ElfError {
    /// Open and header failures are reported to whoever asked for the image;
    /// anything that goes wrong while laying it out halts the kernel.
    pub fn is_fatal(&self) -> bool {
        match self {
            ElfError::NotFound | ElfError::NotAnImage | ElfError::Io | ElfError::UnsupportedArch => false,
            ElfError::Malformed
            | ElfError::SegmentTooLarge
            | ElfError::UnknownSegment(_)
            | ElfError::OutOfMemory
            | ElfError::Map(_)
            | ElfError::SegmentTableFull => true,
        }
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ElfError::NotFound          => write!(f, "File not found"),
            ElfError::NotAnImage        => write!(f, "Not an ELF image"),
            ElfError::Io                => write!(f, "Image read error"),
            ElfError::UnsupportedArch   => write!(f, "Unsupported architecture"),
            ElfError::Malformed         => write!(f, "Malformed program header"),
            ElfError::SegmentTooLarge   => write!(f, "Loadable segment larger than a page"),
            ElfError::UnknownSegment(x) => write!(f, "Unknown program segment, flags {:#x}", x),
            ElfError::OutOfMemory       => write!(f, "Memory allocation error"),
            ElfError::Map(err)          => write!(f, "Mapping error: {}", err),
            ElfError::SegmentTableFull  => write!(f, "Segment table full"),
        }
    }
}

impl From<ProcError> for ElfError {
    fn from(err: ProcError) -> Self {
        match err {
            ProcError::OutOfMemory => ElfError::OutOfMemory,
            ProcError::SegmentTableFull => ElfError::SegmentTableFull,
            ProcError::Map(vm) => ElfError::Map(vm),
            ProcError::Load(elf) => elf,
            other => panic!("elf: unexpected error while placing a segment: {}", other),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF Loader
// ══════════════════════════════════════════════════════════════

/// What a successful `load` put into the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtAddr,
    pub code_pages: usize,
    pub data_pages: usize,
}

/// A validated image header bound to its source.
pub struct ElfLoader<'a, S: ImageSource + ?Sized> {
    source: &'a S,
    header: ElfHeader,
}

impl<'a, S: ImageSource + ?Sized> ElfLoader<'a, S> {
    /// Read and check the ELF header.
    pub fn init(source: &'a S) -> Result<Self, ElfError> {
        let mut raw = [0u8; EHDR_SIZE];
        if source.read_at(&mut raw, 0)? != EHDR_SIZE {
            return Err(ElfError::Io);
        }
        let header = ElfHeader::parse(&raw)?;
        Ok(ElfLoader { source, header })
    }

    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    pub fn entry(&self) -> VirtAddr {
        VirtAddr(self.header.entry)
    }

    fn program_header(&self, index: u16) -> Result<ProgramHeader, ElfError> {
        let offset = (index as u64)
            .checked_mul(self.header.phentsize as u64)
            .and_then(|off| off.checked_add(self.header.phoff))
            .ok_or(ElfError::Malformed)?;
        let mut raw = [0u8; PHDR_SIZE];
        if self.source.read_at(&mut raw, offset)? != PHDR_SIZE {
            return Err(ElfError::Io);
        }
        Ok(ProgramHeader::parse(&raw))
    }

    /// Every LOAD entry, checked for everything that can be decided without
    /// touching memory. Nothing is allocated if this fails.
    pub fn loadable_segments(&self) -> Result<Vec<(ProgramHeader, SegmentKind)>, ElfError> {
        let mut out = Vec::new();
        for index in 0..self.header.phnum {
            let ph = self.program_header(index)?;
            if ph.p_type != PT_LOAD { continue; }
            if ph.memsz < ph.filesz { return Err(ElfError::Malformed); }
            if ph.vaddr.checked_add(ph.memsz).is_none() { return Err(ElfError::Malformed); }
            if (ph.vaddr as usize % PAGE_SIZE) as u64 + ph.memsz > PAGE_SIZE as u64 {
                return Err(ElfError::SegmentTooLarge);
            }
            let kind = ph.kind()?;
            out.push((ph, kind));
        }
        Ok(out)
    }

    /// Give every LOAD segment one fresh page in `space`, copy its bytes in,
    /// record it in the segment table and point the trap frame at the entry.
    pub fn load<F: FrameAllocator, M: AddressMapper>(
        &self,
        frames: &mut F,
        mapper: &M,
        space: &mut AddressSpace,
        shared: &mut SharedFrames,
    ) -> Result<LoadedImage, ElfError> {
        let segments = self.loadable_segments()?;
        let mut loaded = LoadedImage {
            entry: self.entry(),
            code_pages: 0,
            data_pages: 0,
        };

        for (ph, kind) in segments {
            let pa = frames.alloc_page().ok_or(ElfError::OutOfMemory)?;
            let va = VirtAddr(ph.vaddr);
            let start = va.page_offset();
            let len = ph.filesz as usize;
            let read = self
                .source
                .read_at(&mut frames.page_mut(pa).0[start..start + len], ph.offset);
            if read != Ok(len) {
                frames.free_page(pa);
                return Err(read.err().unwrap_or(ElfError::Io));
            }

            if let Err(err) = space.map_segment(frames, mapper, va.align_down(), pa, ph.permissions(), kind) {
                frames.free_page(pa);
                return Err(err.into());
            }
            crate::log_info!(
                "elf: {} segment at {:#x} in table slot {}",
                kind,
                va.align_down(),
                space.segments.len() - 1
            );

            match kind {
                SegmentKind::Code => {
                    shared.insert(pa);
                    loaded.code_pages += 1;
                }
                SegmentKind::Data => loaded.data_pages += 1,
                SegmentKind::Stack | SegmentKind::Context | SegmentKind::System => {
                    unreachable!("images only carry CODE and DATA")
                }
            }
        }

        space.trap_frame_mut(frames).epc = self.header.entry;
        crate::log_info!("elf: entry point (virtual address) {:#x}", self.header.entry);
        Ok(loaded)
    }
}
