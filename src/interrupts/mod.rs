#[cfg(target_arch = "riscv64")]
pub mod usermode;
