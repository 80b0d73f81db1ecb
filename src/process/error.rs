use core::fmt;

use super::pcb::{Pid, ProcessState};
use super::segment::TableFull;
use crate::loader::elf::ElfError;
use crate::memory::{VirtAddr, VmError};

/// Errors raised by the process pool and lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Every record in the pool is in use.
    PoolExhausted,
    /// The frame allocator ran dry.
    OutOfMemory,
    /// A process's segment table has no room for another descriptor.
    SegmentTableFull,
    Map(VmError),
    NoSuchProcess(Pid),
    InvalidState { pid: Pid, status: ProcessState },
    Load(ElfError),
    /// argv does not fit the fresh user stack.
    ArgumentsTooLarge,
    /// Address is not a page the process may free.
    BadAddress(VirtAddr),
}

impl ProcError {
    /// Whether the kernel must halt rather than report this to user space.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcError::PoolExhausted
            | ProcError::OutOfMemory
            | ProcError::SegmentTableFull
            | ProcError::Map(_) => true,
            ProcError::Load(err) => err.is_fatal(),
            ProcError::NoSuchProcess(_)
            | ProcError::InvalidState { .. }
            | ProcError::ArgumentsTooLarge
            | ProcError::BadAddress(_) => false,
        }
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcError::PoolExhausted => write!(f, "process pool exhausted"),
            ProcError::OutOfMemory => write!(f, "out of physical frames"),
            ProcError::SegmentTableFull => write!(f, "segment table full"),
            ProcError::Map(err) => write!(f, "mapping failed: {}", err),
            ProcError::NoSuchProcess(pid) => write!(f, "no process with pid {}", pid),
            ProcError::InvalidState { pid, status } => {
                write!(f, "process {} is {:?}", pid, status)
            }
            ProcError::Load(err) => write!(f, "image load failed: {}", err),
            ProcError::ArgumentsTooLarge => write!(f, "argument list too large"),
            ProcError::BadAddress(va) => write!(f, "bad user address {:#x}", va),
        }
    }
}

impl From<VmError> for ProcError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfFrames => ProcError::OutOfMemory,
            other => ProcError::Map(other),
        }
    }
}

impl From<TableFull> for ProcError {
    fn from(_: TableFull) -> Self {
        ProcError::SegmentTableFull
    }
}

impl From<ElfError> for ProcError {
    fn from(err: ElfError) -> Self {
        ProcError::Load(err)
    }
}

pub type ProcResult<T> = Result<T, ProcError>;

/// Reportable outcomes of `collect` that are not a reclaimed pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The caller has no matching child at all.
    NoChild,
    /// A matching child exists but has not terminated yet.
    NotYet,
}

impl WaitError {
    /// Value handed back to user space.
    pub fn code(self) -> i64 {
        match self {
            WaitError::NoChild => -1,
            WaitError::NotYet => -2,
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::NoChild => write!(f, "no such child"),
            WaitError::NotYet => write!(f, "child has not exited yet"),
        }
    }
}
