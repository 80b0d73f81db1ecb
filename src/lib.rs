#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod config;
pub mod memory;
pub mod scheduler;
pub mod loader;
pub mod process;
pub mod syscalls;
pub mod interrupts;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::{FrameAllocator, FramePool, PhysAddr, Sv39, VirtAddr};
pub use process::{Pid, ProcessState, ProcessTable};
pub use scheduler::{FifoScheduler, KernelLayout, Scheduler};

/// Bring up the console. The process table is built by the caller once the
/// frame pool and kernel layout are known.
pub fn init() {
    serial::init();
    crate::log_info!("RVOS process core initialized.");
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::log_error!("{}", info);
    loop {
        unsafe { riscv::asm::wfi() };
    }
}
