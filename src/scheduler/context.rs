use crate::memory::{Page, PhysAddr};

/// User integer registers saved on trap entry, in the order the trap vector
/// stores them (x0 is not saved).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RiscvRegs {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

/// Per-process trap frame. Lives in its own page, which is mapped into the
/// process at the page's physical address so the trap vector can reach it
/// with or without the user page table active.
///
/// The field order is shared with the trap vector assembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: RiscvRegs,
    /// Top of the process's kernel stack.
    pub kernel_sp: u64,
    /// Kernel trap handler entered after the vector saves registers.
    pub kernel_trap: u64,
    /// Saved user program counter.
    pub epc: u64,
    /// Kernel `satp` restored by the vector before calling `kernel_trap`.
    pub kernel_satp: u64,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() <= core::mem::size_of::<Page>());

impl TrapFrame {
    pub fn in_page(page: &Page) -> &TrapFrame {
        // SAFETY: Page is 4096-aligned and large enough; every bit pattern is
        // a valid TrapFrame (plain u64 fields).
        unsafe { &*(page.0.as_ptr() as *const TrapFrame) }
    }

    pub fn in_page_mut(page: &mut Page) -> &mut TrapFrame {
        // SAFETY: see `in_page`.
        unsafe { &mut *(page.0.as_mut_ptr() as *mut TrapFrame) }
    }
}

/// Where the kernel keeps the pieces every process needs to reach back into
/// it. Handed to the process table once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    /// Physical page holding the trap vector text; mapped R|X into every
    /// process at this same address.
    pub trap_vector: PhysAddr,
    /// S-mode trap entry inside the trap vector page (`stvec`).
    pub trap_entry: u64,
    /// Kernel-side trap handler the vector jumps to.
    pub trap_handler: u64,
    /// `satp` of the kernel page table.
    pub kernel_satp: u64,
}

/// Everything the return-to-user path needs, computed ahead of the CSR writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub stvec: u64,
    pub sepc: u64,
    pub satp: u64,
    pub trap_frame: PhysAddr,
}

pub const SSTATUS_SPIE: usize = 5;
pub const SSTATUS_SPP: usize = 8;

/// `sstatus` value for an `sret` into user mode: previous privilege U,
/// interrupts enabled once there.
pub fn user_sstatus(sstatus: u64) -> u64 {
    use bit_field::BitField;
    let mut value = sstatus;
    value.set_bit(SSTATUS_SPP, false);
    value.set_bit(SSTATUS_SPIE, true);
    value
}
