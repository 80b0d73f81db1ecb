use alloc::string::String;
use alloc::vec::Vec;

use super::elf::ElfError;

/// Random-access read interface of an executable image.
pub trait ImageSource {
    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`.
    /// Returns how many bytes were read; fewer than asked means end of image.
    fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize, ElfError>;
}

impl ImageSource for [u8] {
    fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize, ElfError> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.len() => start,
            _ => return Ok(0),
        };
        let count = dst.len().min(self.len() - start);
        dst[..count].copy_from_slice(&self[start..start + count]);
        Ok(count)
    }
}

impl ImageSource for Vec<u8> {
    fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize, ElfError> {
        self.as_slice().read_at(dst, offset)
    }
}

/// Where exec finds programs by path.
pub trait ImageStore {
    type Image: ImageSource;

    fn open(&self, path: &str) -> Result<Self::Image, ElfError>;
}

/// Flat in-memory program store, keyed by path.
#[derive(Debug, Default)]
pub struct RamImages {
    files: Vec<(String, Vec<u8>)>,
}

impl RamImages {
    pub fn new() -> Self {
        RamImages { files: Vec::new() }
    }

    /// Add or replace the image stored at `path`.
    pub fn insert(&mut self, path: &str, bytes: Vec<u8>) {
        match self.files.iter_mut().find(|(name, _)| name == path) {
            Some((_, data)) => *data = bytes,
            None => self.files.push((String::from(path), bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ImageStore for RamImages {
    type Image = Vec<u8>;

    fn open(&self, path: &str) -> Result<Vec<u8>, ElfError> {
        self.files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, data)| data.clone())
            .ok_or(ElfError::NotFound)
    }
}
