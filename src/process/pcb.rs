use core::fmt;

use super::space::AddressSpace;
use crate::config::{PAGE_SIZE, USER_FREE_ADDRESS_START};
use crate::memory::{PhysAddr, VirtAddr};

/// Process identifier. Equal to the record's slot in the pool, so it is
/// stable for the life of the kernel and reused after reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub usize);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state machine.
///
/// FREE -> (allocate) -> READY <-> RUNNING <-> BLOCKED -> (exit) -> ZOMBIE
/// -> (collect) -> FREE. The process core only ever writes READY, ZOMBIE and
/// FREE; the rest belongs to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Free,
    Ready,
    Running,
    Blocked,
    Zombie,
}

impl ProcessState {
    /// Column letter used by the process report.
    pub fn letter(self) -> char {
        match self {
            ProcessState::Free => '/',
            ProcessState::Ready => 'S',
            ProcessState::Running => 'R',
            ProcessState::Blocked => 'B',
            ProcessState::Zombie => 'Z',
        }
    }
}

/// One process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub status: ProcessState,
    /// Page table, trap frame and segments. `None` only while FREE.
    pub space: Option<AddressSpace>,
    /// Frame used as this process's kernel stack.
    pub kernel_stack: Option<PhysAddr>,
    /// Identity of the forking process; no ownership.
    pub parent: Option<Pid>,
    /// Ticks in the current time slice.
    pub tick_count: u64,
    pub total_tick_count: u64,
    /// Next address handed out by `alloc_user_page`.
    pub heap_top: VirtAddr,
}

impl Process {
    pub fn free(pid: Pid) -> Self {
        Process {
            pid,
            status: ProcessState::Free,
            space: None,
            kernel_stack: None,
            parent: None,
            tick_count: 0,
            total_tick_count: 0,
            heap_top: VirtAddr(USER_FREE_ADDRESS_START),
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == ProcessState::Free
    }

    pub fn reset_accounting(&mut self) {
        self.tick_count = 0;
        self.total_tick_count = 0;
        self.heap_top = VirtAddr(USER_FREE_ADDRESS_START);
    }

    /// Pages currently described by the segment table.
    pub fn mapped_pages(&self) -> usize {
        self.space.as_ref().map_or(0, |space| space.segments.mapped_pages())
    }

    /// Mapped memory in bytes.
    pub fn total_mem_count(&self) -> usize {
        self.mapped_pages() * PAGE_SIZE
    }

    /// Top of the kernel stack, as loaded into `sp` on trap entry.
    pub fn kernel_stack_top(&self) -> Option<u64> {
        self.kernel_stack.map(|pa| pa.0 + PAGE_SIZE as u64)
    }
}
