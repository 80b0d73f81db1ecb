//! Return to user mode on RISC-V.

use core::convert::Infallible;

use riscv::register::{sepc, stvec};

use crate::memory::{AddressMapper, FrameAllocator};
use crate::process::{Pid, ProcResult, ProcessTable};
use crate::scheduler::context::user_sstatus;
use crate::scheduler::UserEntry;

extern "C" {
    /// Trap vector exit path: switches to `satp`, restores the user registers
    /// from the trap frame at `trap_frame` and executes `sret`.
    fn return_to_user(trap_frame: u64, satp: u64) -> !;
}

/// Program the trap CSRs from `entry` and drop into user mode.
///
/// # Safety
/// `entry` must come from `ProcessTable::prepare_switch`, and the trap vector
/// page it names must hold the vector text `return_to_user` lives in.
pub unsafe fn enter_user(entry: UserEntry) -> ! {
    stvec::write(entry.stvec as usize, stvec::TrapMode::Direct);

    let current: u64;
    core::arch::asm!("csrr {0}, sstatus", out(reg) current);
    core::arch::asm!("csrw sstatus, {0}", in(reg) user_sstatus(current));

    sepc::write(entry.sepc as usize);
    return_to_user(entry.trap_frame.as_u64(), entry.satp)
}

/// Resume `pid` in user mode. Only returns if the process cannot be run.
///
/// # Safety
/// See `enter_user`. The caller's kernel context is abandoned; it resumes
/// through `kernel_trap` on the next trap from this process.
pub unsafe fn switch_to<F: FrameAllocator, M: AddressMapper>(
    table: &mut ProcessTable<F, M>,
    pid: Pid,
) -> ProcResult<Infallible> {
    let entry = table.prepare_switch(pid)?;
    enter_user(entry)
}
