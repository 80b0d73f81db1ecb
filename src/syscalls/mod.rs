//! Kernel-side entry points of the process system calls.
//!
//! Arguments arrive already translated into kernel space. Fatal errors halt
//! the kernel; everything else comes back to user space as a negative value.

use crate::loader::{ImageSource, ImageStore};
use crate::memory::{AddressMapper, FrameAllocator, VirtAddr};
use crate::process::{Pid, ProcResult, ProcessTable};
use crate::scheduler::Scheduler;

/// Syscall numbers of the user ABI.
pub const SYS_USER_BASE: u64        = 64;
pub const SYS_USER_EXIT: u64        = SYS_USER_BASE + 1;
pub const SYS_USER_ALLOCATE_PAGE: u64 = SYS_USER_BASE + 2;
pub const SYS_USER_FREE_PAGE: u64   = SYS_USER_BASE + 3;
pub const SYS_USER_FORK: u64        = SYS_USER_BASE + 4;
pub const SYS_USER_YIELD: u64       = SYS_USER_BASE + 5;
pub const SYS_USER_WAIT: u64        = SYS_USER_BASE + 14;
pub const SYS_USER_EXEC: u64        = SYS_USER_BASE + 16;
pub const SYS_USER_GETINFO: u64     = SYS_USER_BASE + 21;

/// Split a core result into a value or the code user space sees.
fn settle<T>(what: &str, result: ProcResult<T>) -> Result<T, i64> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_fatal() => panic!("{}: {}", what, err),
        Err(err) => {
            crate::log_warn!("{}: {}", what, err);
            Err(-1)
        }
    }
}

/// sys_exit: terminate `current`. Its resources stay put until the parent
/// collects it; the caller must schedule something else.
pub fn sys_exit<F, M, S>(table: &mut ProcessTable<F, M>, sched: &mut S, current: Pid, code: i64) -> i64
where
    F: FrameAllocator,
    M: AddressMapper,
    S: Scheduler,
{
    crate::log_info!("syscall: process {} exits with code {}", current, code);
    match settle("exit", table.mark_terminated(current)) {
        Ok(()) => {
            sched.forget(current);
            0
        }
        Err(code) => code,
    }
}

/// sys_fork: returns the child's pid to the parent.
pub fn sys_fork<F, M, S>(table: &mut ProcessTable<F, M>, sched: &mut S, current: Pid) -> i64
where
    F: FrameAllocator,
    M: AddressMapper,
    S: Scheduler,
{
    match settle("fork", table.fork(current, sched)) {
        Ok(child) => child.0 as i64,
        Err(code) => code,
    }
}

/// sys_wait: `pid > 0` waits for that child, anything else for any child.
/// -1: no such child, -2: not exited yet.
pub fn sys_wait<F, M, S>(table: &mut ProcessTable<F, M>, sched: &mut S, current: Pid, pid: i64) -> i64
where
    F: FrameAllocator,
    M: AddressMapper,
    S: Scheduler,
{
    let filter = if pid > 0 { Some(Pid(pid as usize)) } else { None };
    match table.collect(current, filter, sched) {
        Ok(reaped) => reaped.0 as i64,
        Err(err) => err.code(),
    }
}

/// sys_exec: replace `current`'s program with the image at `path`.
///
/// Returns `argc`, which the trap return writes back into `a0` where the new
/// program expects it.
pub fn sys_exec<F, M, I>(table: &mut ProcessTable<F, M>, store: &I, current: Pid, path: &str, argv: &[&str]) -> i64
where
    F: FrameAllocator,
    M: AddressMapper,
    I: ImageStore,
{
    let image = match store.open(path) {
        Ok(image) => image,
        Err(err) => {
            crate::log_warn!("exec: cannot open {}: {}", path, err);
            return -1;
        }
    };
    crate::log_info!("syscall: process {} execs {}", current, path);
    exec_image(table, &image, current, argv)
}

fn exec_image<F, M, I>(table: &mut ProcessTable<F, M>, image: &I, current: Pid, argv: &[&str]) -> i64
where
    F: FrameAllocator,
    M: AddressMapper,
    I: ImageSource + ?Sized,
{
    match settle("exec", table.exec(current, image, argv)) {
        Ok(_) => argv.len() as i64,
        Err(code) => code,
    }
}

/// sys_yield: give up the hart.
pub fn sys_yield<F, M, S>(table: &mut ProcessTable<F, M>, sched: &mut S, current: Pid) -> i64
where
    F: FrameAllocator,
    M: AddressMapper,
    S: Scheduler,
{
    match settle("yield", table.yield_current(current, sched)) {
        Ok(()) => 0,
        Err(code) => code,
    }
}

/// sys_alloc_page: map a fresh page and return its user address.
pub fn sys_alloc_page<F: FrameAllocator, M: AddressMapper>(table: &mut ProcessTable<F, M>, current: Pid) -> i64 {
    match settle("allocate_page", table.alloc_user_page(current)) {
        Ok(va) => va.as_u64() as i64,
        Err(code) => code,
    }
}

pub fn sys_free_page<F: FrameAllocator, M: AddressMapper>(table: &mut ProcessTable<F, M>, current: Pid, va: u64) -> i64 {
    match settle("free_page", table.free_user_page(current, VirtAddr(va))) {
        Ok(()) => 0,
        Err(code) => code,
    }
}

/// sys_getinfo: print the process table.
pub fn sys_getinfo<F: FrameAllocator, M: AddressMapper>(table: &ProcessTable<F, M>) -> i64 {
    crate::log_info!("{}", table.report());
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::RamImages;
    use crate::process::ProcessState;
    use crate::scheduler::FifoScheduler;
    use crate::testing::{self, hello_image};

    #[test]
    fn abi_numbers() {
        assert_eq!(SYS_USER_EXIT, 65);
        assert_eq!(SYS_USER_FORK, 68);
        assert_eq!(SYS_USER_WAIT, 78);
        assert_eq!(SYS_USER_EXEC, 80);
        assert_eq!(SYS_USER_GETINFO, 85);
    }

    #[test]
    fn fork_wait_exit_round_trip() {
        let mut table = testing::table(128, 4);
        let mut sched = FifoScheduler::new();
        let parent = table.spawn(&hello_image()[..], &mut sched).unwrap();

        let child = sys_fork(&mut table, &mut sched, parent);
        assert_eq!(child, 1);
        assert_eq!(sys_wait(&mut table, &mut sched, parent, -1), -2);
        assert_eq!(sys_exit(&mut table, &mut sched, Pid(1), 0), 0);
        assert_eq!(table.get(Pid(1)).unwrap().status, ProcessState::Zombie);
        assert_eq!(sys_wait(&mut table, &mut sched, parent, child), 1);
        assert_eq!(sys_wait(&mut table, &mut sched, parent, -1), -1);
        assert_eq!(sys_getinfo(&table), 1);
    }

    #[test]
    fn exec_reports_missing_programs() {
        let mut table = testing::table(128, 2);
        let mut sched = FifoScheduler::new();
        let pid = table.spawn(&hello_image()[..], &mut sched).unwrap();
        let mut store = RamImages::new();
        store.insert("/bin/hello", hello_image());

        assert_eq!(sys_exec(&mut table, &store, pid, "/bin/missing", &["missing"]), -1);
        assert_eq!(sys_exec(&mut table, &store, pid, "/bin/hello", &["hello", "world"]), 2);
        assert_eq!(table.trap_frame(pid).unwrap().regs.a0, 2);
    }

    #[test]
    fn heap_pages_through_syscalls() {
        let mut table = testing::table(128, 2);
        let mut sched = FifoScheduler::new();
        let pid = table.spawn(&hello_image()[..], &mut sched).unwrap();
        let va = sys_alloc_page(&mut table, pid);
        assert_eq!(va as u64, crate::config::USER_FREE_ADDRESS_START);
        assert_eq!(sys_free_page(&mut table, pid, va as u64), 0);
        assert_eq!(sys_free_page(&mut table, pid, va as u64), -1);
        assert_eq!(sys_yield(&mut table, &mut sched, pid), 0);
    }

    #[test]
    #[should_panic(expected = "fork")]
    fn fatal_errors_halt() {
        let mut table = testing::table(128, 1);
        let mut sched = FifoScheduler::new();
        let pid = table.spawn(&hello_image()[..], &mut sched).unwrap();
        sys_fork(&mut table, &mut sched, pid);
    }
}
