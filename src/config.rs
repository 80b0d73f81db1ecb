//! Compile-time kernel parameters shared by the process core.

/// Size of one physical frame / virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Default number of process records in the pool.
pub const NPROC: usize = 32;

/// Virtual address one past the top of every user stack.
pub const USER_STACK_TOP: u64 = 0x7fff_f000;

/// First virtual address handed out by the per-process page heap.
pub const USER_FREE_ADDRESS_START: u64 = 0x0040_0000;

/// Upper bound on argv strings accepted by exec.
pub const MAX_CMDLINE_ARGS: usize = 10;

/// MMIO base of the 16550 UART on the QEMU `virt` board.
pub const UART0_BASE: usize = 0x1000_0000;

/// `satp.MODE` value selecting Sv39 translation.
pub const SATP_MODE_SV39: u64 = 8;
