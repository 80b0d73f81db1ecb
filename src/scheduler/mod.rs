pub mod context;

use alloc::collections::VecDeque;

use crate::process::Pid;
pub use context::{KernelLayout, RiscvRegs, TrapFrame, UserEntry};

/// Ready-queue contract the process core hands runnable processes to.
pub trait Scheduler {
    /// Queue `pid` to run later. The caller has already marked it READY.
    fn enqueue_ready(&mut self, pid: Pid);

    /// Pick the next process to run, if any.
    fn schedule(&mut self) -> Option<Pid>;

    /// The process currently holding the hart.
    fn current(&self) -> Option<Pid>;

    /// Drop every reference to `pid`; its record is being reclaimed.
    fn forget(&mut self, pid: Pid);
}

/// Round-robin ready queue.
#[derive(Debug, Default)]
pub struct FifoScheduler {
    /// Currently running process (if any).
    pub current: Option<Pid>,
    /// Processes waiting to run, oldest first.
    pub ready_queue: VecDeque<Pid>,
}

impl FifoScheduler {
    pub fn new() -> Self {
        FifoScheduler {
            current: None,
            ready_queue: VecDeque::new(),
        }
    }

    pub fn is_queued(&self, pid: Pid) -> bool {
        self.ready_queue.contains(&pid)
    }
}

impl Scheduler for FifoScheduler {
    fn enqueue_ready(&mut self, pid: Pid) {
        if !self.ready_queue.contains(&pid) {
            self.ready_queue.push_back(pid);
        }
    }

    fn schedule(&mut self) -> Option<Pid> {
        self.current = self.ready_queue.pop_front();
        self.current
    }

    fn current(&self) -> Option<Pid> {
        self.current
    }

    fn forget(&mut self, pid: Pid) {
        self.ready_queue.retain(|&queued| queued != pid);
        if self.current == Some(pid) {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_in_arrival_order() {
        let mut sched = FifoScheduler::new();
        sched.enqueue_ready(Pid(2));
        sched.enqueue_ready(Pid(0));
        sched.enqueue_ready(Pid(2));
        assert_eq!(sched.ready_queue.len(), 2);
        assert_eq!(sched.schedule(), Some(Pid(2)));
        assert_eq!(sched.current(), Some(Pid(2)));
        assert_eq!(sched.schedule(), Some(Pid(0)));
        assert_eq!(sched.schedule(), None);
        assert_eq!(sched.current(), None);
    }

    #[test]
    fn forget_clears_queue_and_current() {
        let mut sched = FifoScheduler::new();
        sched.enqueue_ready(Pid(1));
        sched.enqueue_ready(Pid(3));
        sched.schedule();
        sched.forget(Pid(1));
        sched.forget(Pid(3));
        assert!(!sched.is_queued(Pid(3)));
        assert_eq!(sched.current(), None);
    }
}
