use core::fmt;
use core::mem::size_of;

use crate::config::PAGE_SIZE;
use crate::memory::VirtAddr;

/// What a mapped region of a process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Loaded text. Frames may be shared with forked relatives.
    Code,
    /// Loaded data or heap pages. Always private.
    Data,
    /// The user stack.
    Stack,
    /// The trap frame page.
    Context,
    /// The kernel trap vector text.
    System,
}

/// How a segment's pages are given back when its address space is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Unmap and free the backing frame.
    UnmapAndFree,
    /// Unmap, then drop one reference on the shared frame; free on the last.
    ReleaseShared,
    /// Unmap only; the frame belongs to the kernel.
    UnmapOnly,
}

impl SegmentKind {
    pub fn reclaim(self) -> Reclaim {
        match self {
            SegmentKind::Stack | SegmentKind::Context | SegmentKind::Data => Reclaim::UnmapAndFree,
            SegmentKind::Code => Reclaim::ReleaseShared,
            SegmentKind::System => Reclaim::UnmapOnly,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SegmentKind::Code => "CODE",
            SegmentKind::Data => "DATA",
            SegmentKind::Stack => "STACK",
            SegmentKind::Context => "CONTEXT",
            SegmentKind::System => "SYSTEM",
        };
        f.write_str(name)
    }
}

/// One page-aligned region of a process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: VirtAddr,
    pub pages: usize,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn new(base: VirtAddr, pages: usize, kind: SegmentKind) -> Self {
        Segment { base, pages, kind }
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va.0 >= self.base.0 && va.0 < self.base.0 + self.len() as u64
    }
}

/// As many descriptors as fit in one page.
pub const SEGMENT_TABLE_CAPACITY: usize = PAGE_SIZE / size_of::<Segment>();

/// The table is full; a process cannot describe another region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

/// Fixed-capacity, ordered list of a process's segments.
///
/// Append-only while an address space is being built; entries are only
/// removed when a heap page is handed back.
#[derive(Debug, Clone)]
pub struct SegmentTable {
    entries: [Option<Segment>; SEGMENT_TABLE_CAPACITY],
    len: usize,
}

impl SegmentTable {
    pub fn new() -> Self {
        SegmentTable {
            entries: [None; SEGMENT_TABLE_CAPACITY],
            len: 0,
        }
    }

    pub fn push(&mut self, segment: Segment) -> Result<usize, TableFull> {
        if self.len == SEGMENT_TABLE_CAPACITY {
            return Err(TableFull);
        }
        self.entries[self.len] = Some(segment);
        self.len += 1;
        Ok(self.len - 1)
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.entries[..self.len].get(index).and_then(Option::as_ref)
    }

    /// Remove the entry at `index`, keeping the rest in order.
    pub fn remove(&mut self, index: usize) -> Option<Segment> {
        if index >= self.len {
            return None;
        }
        let removed = self.entries[index].take();
        self.entries[index..self.len].rotate_left(1);
        self.len -= 1;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.entries[..self.len].iter().flatten()
    }

    /// Index of the segment covering `va`.
    pub fn find(&self, va: VirtAddr) -> Option<usize> {
        self.iter().position(|seg| seg.contains(va))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == SEGMENT_TABLE_CAPACITY
    }

    pub fn mapped_pages(&self) -> usize {
        self.iter().map(|seg| seg.pages).sum()
    }

    pub fn count(&self, kind: SegmentKind) -> usize {
        self.iter().filter(|seg| seg.kind == kind).count()
    }
}

impl Default for SegmentTable {
    fn default() -> Self {
        SegmentTable::new()
    }
}
