pub mod error;
pub mod lifecycle;
pub mod pcb;
pub mod report;
pub mod segment;
pub mod space;


use alloc::vec::Vec;

pub use error::{ProcError, ProcResult, WaitError};
pub use pcb::{Pid, Process, ProcessState};
pub use report::{ProcessInfo, ProcessReport};
pub use segment::{Reclaim, Segment, SegmentKind, SegmentTable, SEGMENT_TABLE_CAPACITY};
pub use space::AddressSpace;

use crate::config::NPROC;
use crate::memory::{AddressMapper, FrameAllocator, SharedFrames, Sv39};
use crate::scheduler::{KernelLayout, Scheduler, TrapFrame, UserEntry};

/// The process pool and everything it needs to build and tear down address
/// spaces. One of these exists per kernel and is passed to every operation.
pub struct ProcessTable<F: FrameAllocator, M: AddressMapper = Sv39> {
    procs: Vec<Process>,
    frames: F,
    mapper: M,
    layout: KernelLayout,
    shared: SharedFrames,
    /// Ticks charged to any process since boot.
    ticks: u64,
}

impl<F: FrameAllocator, M: AddressMapper> ProcessTable<F, M> {
    pub fn new(frames: F, mapper: M, layout: KernelLayout, capacity: usize) -> Self {
        let procs = (0..capacity).map(|slot| Process::free(Pid(slot))).collect();
        crate::log_info!("process table: {} slots, trap vector at {:#x}", capacity, layout.trap_vector);
        ProcessTable {
            procs,
            frames,
            mapper,
            layout,
            shared: SharedFrames::new(),
            ticks: 0,
        }
    }

    pub fn with_default_capacity(frames: F, mapper: M, layout: KernelLayout) -> Self {
        Self::new(frames, mapper, layout, NPROC)
    }

    pub fn capacity(&self) -> usize {
        self.procs.len()
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn shared(&self) -> &SharedFrames {
        &self.shared
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Every record that is not FREE, in pool order.
    pub fn iter(&self) -> impl Iterator<Item = &Process> + '_ {
        self.procs.iter().filter(|proc| !proc.is_free())
    }

    /// A record that is in use.
    pub fn get(&self, pid: Pid) -> ProcResult<&Process> {
        match self.procs.get(pid.0) {
            Some(proc) if !proc.is_free() => Ok(proc),
            _ => Err(ProcError::NoSuchProcess(pid)),
        }
    }

    fn get_mut(&mut self, pid: Pid) -> ProcResult<&mut Process> {
        match self.procs.get_mut(pid.0) {
            Some(proc) if !proc.is_free() => Ok(proc),
            _ => Err(ProcError::NoSuchProcess(pid)),
        }
    }

    /// A record that may still run: in use and not yet terminated.
    fn live(&self, pid: Pid) -> ProcResult<&Process> {
        let proc = self.get(pid)?;
        if proc.status == ProcessState::Zombie {
            return Err(ProcError::InvalidState { pid, status: proc.status });
        }
        Ok(proc)
    }

    pub fn space(&self, pid: Pid) -> ProcResult<&AddressSpace> {
        let proc = self.get(pid)?;
        proc.space
            .as_ref()
            .ok_or(ProcError::InvalidState { pid, status: proc.status })
    }

    pub fn trap_frame(&self, pid: Pid) -> ProcResult<&TrapFrame> {
        let space = self.space(pid)?;
        Ok(space.trap_frame(&self.frames))
    }

    pub fn trap_frame_mut(&mut self, pid: Pid) -> ProcResult<&mut TrapFrame> {
        let page = self.space(pid)?.trap_frame;
        Ok(TrapFrame::in_page_mut(self.frames.page_mut(page)))
    }

    /// Claim the first FREE record and give it a kernel stack and a fresh
    /// address space. The record comes back READY but is not queued; the
    /// caller decides when it may run.
    pub fn allocate(&mut self) -> ProcResult<Pid> {
        let slot = self
            .procs
            .iter()
            .position(Process::is_free)
            .ok_or(ProcError::PoolExhausted)?;

        let kernel_stack = self.frames.alloc_page().ok_or(ProcError::OutOfMemory)?;
        let space = match AddressSpace::build(&mut self.frames, &self.mapper, &self.layout) {
            Ok(space) => space,
            Err(err) => {
                self.frames.free_page(kernel_stack);
                return Err(err);
            }
        };

        let proc = &mut self.procs[slot];
        proc.reset_accounting();
        proc.parent = None;
        proc.kernel_stack = Some(kernel_stack);
        crate::log_info!(
            "process {}: trap frame {:#x}, user stack {:#x}, kernel stack {:#x}",
            proc.pid,
            space.trap_frame,
            crate::config::USER_STACK_TOP,
            kernel_stack
        );
        proc.space = Some(space);
        proc.status = ProcessState::Ready;
        Ok(proc.pid)
    }

    /// First half of process exit. Only the status changes: the process may
    /// still be running on the kernel stack and page table it owns.
    pub fn mark_terminated(&mut self, pid: Pid) -> ProcResult<()> {
        self.live(pid)?;
        let proc = self.get_mut(pid)?;
        proc.status = ProcessState::Zombie;
        crate::log_info!("process {}: terminated, waiting to be collected", pid);
        Ok(())
    }

    /// Second half of process exit: reclaim a terminated child of `parent`.
    ///
    /// Children are scanned in pool order. With `filter` set only that pid
    /// matches. Returns the pid that was reclaimed.
    pub fn collect<S: Scheduler>(
        &mut self,
        parent: Pid,
        filter: Option<Pid>,
        sched: &mut S,
    ) -> Result<Pid, WaitError> {
        let mut found_child = false;
        for slot in 0..self.procs.len() {
            let proc = &self.procs[slot];
            if proc.is_free() || proc.parent != Some(parent) {
                continue;
            }
            if filter.map_or(false, |want| want != proc.pid) {
                continue;
            }
            found_child = true;
            if proc.status == ProcessState::Zombie {
                let pid = proc.pid;
                for reaped in self.reclaim(pid) {
                    sched.forget(reaped);
                }
                return Ok(pid);
            }
        }
        if found_child {
            Err(WaitError::NotYet)
        } else {
            Err(WaitError::NoChild)
        }
    }

    /// Release everything `pid` owns and return its record to the pool.
    /// Returns every pid whose record became FREE, `pid` first.
    fn reclaim(&mut self, pid: Pid) -> Vec<Pid> {
        let proc = &mut self.procs[pid.0];
        let space = proc.space.take();
        let kernel_stack = proc.kernel_stack.take();

        if let Some(kernel_stack) = kernel_stack {
            self.frames.free_page(kernel_stack);
        }
        if let Some(space) = space {
            space.teardown(&mut self.frames, &self.mapper, &mut self.shared);
        }

        let proc = &mut self.procs[pid.0];
        proc.status = ProcessState::Free;
        proc.parent = None;
        proc.reset_accounting();
        crate::log_info!("process {}: reclaimed", pid);

        // Nobody is left to collect this process's children.
        let orphans: Vec<Pid> = self
            .procs
            .iter()
            .filter(|child| !child.is_free() && child.parent == Some(pid))
            .map(|child| child.pid)
            .collect();
        let mut reaped = alloc::vec![pid];
        for orphan in orphans {
            if self.procs[orphan.0].status == ProcessState::Zombie {
                reaped.extend(self.reclaim(orphan));
            } else {
                self.procs[orphan.0].parent = None;
            }
        }
        reaped
    }

    /// Drop a record that never ran, e.g. after a failed fork or spawn.
    pub(crate) fn discard(&mut self, pid: Pid) {
        self.reclaim(pid);
    }

    /// Mark `pid` runnable and hand it to the ready queue.
    pub fn set_ready<S: Scheduler>(&mut self, pid: Pid, sched: &mut S) -> ProcResult<()> {
        self.live(pid)?;
        self.get_mut(pid)?.status = ProcessState::Ready;
        sched.enqueue_ready(pid);
        Ok(())
    }

    /// Scheduler-owned transitions (RUNNING, BLOCKED).
    pub fn set_status(&mut self, pid: Pid, status: ProcessState) -> ProcResult<()> {
        let current = self.live(pid)?.status;
        match status {
            ProcessState::Ready | ProcessState::Running | ProcessState::Blocked => {
                self.get_mut(pid)?.status = status;
                Ok(())
            }
            ProcessState::Free | ProcessState::Zombie => Err(ProcError::InvalidState { pid, status: current }),
        }
    }

    /// Charge one timer tick to `pid`.
    pub fn charge_tick(&mut self, pid: Pid) -> ProcResult<()> {
        let proc = self.get_mut(pid)?;
        proc.tick_count += 1;
        proc.total_tick_count += 1;
        self.ticks += 1;
        Ok(())
    }

    /// Fill in the kernel re-entry fields of `pid`'s trap frame and compute
    /// the CSR values for returning to it.
    pub fn prepare_switch(&mut self, pid: Pid) -> ProcResult<UserEntry> {
        let proc = self.live(pid)?;
        let invalid = ProcError::InvalidState { pid, status: proc.status };
        let kernel_sp = proc.kernel_stack_top().ok_or(invalid)?;
        let space = proc.space.as_ref().ok_or(invalid)?;
        let (root, trap_frame) = (space.root, space.trap_frame);
        let layout = self.layout;

        let tf = TrapFrame::in_page_mut(self.frames.page_mut(trap_frame));
        tf.kernel_sp = kernel_sp;
        tf.kernel_satp = layout.kernel_satp;
        tf.kernel_trap = layout.trap_handler;

        Ok(UserEntry {
            stvec: layout.trap_entry,
            sepc: tf.epc,
            satp: self.mapper.satp(root),
            trap_frame,
        })
    }

    /// Read-only view of the pool for monitoring.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.iter().map(ProcessInfo::of).collect()
    }

    pub fn report(&self) -> ProcessReport {
        ProcessReport {
            processes: self.snapshot(),
            ticks: self.ticks,
            free_frames: self.frames.free_frames(),
        }
    }
}
