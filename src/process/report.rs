use alloc::vec::Vec;
use core::fmt;

use super::pcb::{Pid, Process, ProcessState};
use crate::config::PAGE_SIZE;

/// Accounting view of one process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub status: ProcessState,
    /// Mapped pages times the page size.
    pub total_mem_count: usize,
    pub total_tick_count: u64,
}

impl ProcessInfo {
    pub fn of(proc: &Process) -> Self {
        ProcessInfo {
            pid: proc.pid,
            status: proc.status,
            total_mem_count: proc.total_mem_count(),
            total_tick_count: proc.total_tick_count,
        }
    }
}

/// `top`-style summary of the process pool.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub processes: Vec<ProcessInfo>,
    pub ticks: u64,
    pub free_frames: usize,
}

impl ProcessReport {
    pub fn count(&self, status: ProcessState) -> usize {
        self.processes.iter().filter(|info| info.status == status).count()
    }
}

impl fmt::Display for ProcessReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "top - ")?;
        writeln!(
            f,
            "Tasks: {} total, {} ready, {} running, {} blocked, {} zombie",
            self.processes.len(),
            self.count(ProcessState::Ready),
            self.count(ProcessState::Running),
            self.count(ProcessState::Blocked),
            self.count(ProcessState::Zombie)
        )?;
        writeln!(f, "Cpu(s): {} ticks", self.ticks)?;
        writeln!(f, "KiB Free: {}", self.free_frames * PAGE_SIZE / 1024)?;
        writeln!(f)?;
        writeln!(f, "PID\tS\tMEM\tTICK")?;
        for info in &self.processes {
            writeln!(
                f,
                "{}\t{}\t{}\t{}",
                info.pid,
                info.status.letter(),
                info.total_mem_count / 1024,
                info.total_tick_count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn renders_top_table() {
        let report = ProcessReport {
            processes: vec![
                ProcessInfo {
                    pid: Pid(0),
                    status: ProcessState::Running,
                    total_mem_count: 4 * PAGE_SIZE,
                    total_tick_count: 12,
                },
                ProcessInfo {
                    pid: Pid(3),
                    status: ProcessState::Zombie,
                    total_mem_count: 3 * PAGE_SIZE,
                    total_tick_count: 1,
                },
            ],
            ticks: 13,
            free_frames: 2,
        };
        let text = report.to_string();
        assert!(text.contains("Tasks: 2 total, 0 ready, 1 running, 0 blocked, 1 zombie"));
        assert!(text.contains("Cpu(s): 13 ticks"));
        assert!(text.contains("KiB Free: 8"));
        assert!(text.contains("0\tR\t16\t12\n"));
        assert!(text.contains("3\tZ\t12\t1\n"));
    }
}
