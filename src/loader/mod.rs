pub mod elf;
pub mod image;

pub use elf::{ElfError, ElfLoader, LoadedImage};
pub use image::{ImageSource, ImageStore, RamImages};
