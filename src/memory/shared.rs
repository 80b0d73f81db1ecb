use alloc::collections::BTreeMap;

use super::PhysAddr;

/// Reference counts for frames mapped as CODE by more than one address space.
///
/// A frame enters the table when the loader maps it, gains a reference for
/// every fork that aliases it, and is handed back for freeing when the last
/// address space mapping it lets go.
#[derive(Debug, Default)]
pub struct SharedFrames {
    counts: BTreeMap<PhysAddr, usize>,
}

impl SharedFrames {
    pub fn new() -> Self {
        SharedFrames { counts: BTreeMap::new() }
    }

    /// Start tracking a freshly loaded frame with a single owner.
    pub fn insert(&mut self, pa: PhysAddr) {
        let previous = self.counts.insert(pa, 1);
        debug_assert!(previous.is_none(), "shared frame {:?} registered twice", pa);
    }

    /// Another address space now maps `pa`.
    pub fn acquire(&mut self, pa: PhysAddr) {
        *self.counts.entry(pa).or_insert(0) += 1;
    }

    /// Drop one reference. Returns `true` when the caller held the last one
    /// and must free the frame.
    pub fn release(&mut self, pa: PhysAddr) -> bool {
        match self.counts.get_mut(&pa) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&pa);
                true
            }
            None => {
                crate::log_warn!("shared frames: release of untracked frame {:#x}", pa);
                false
            }
        }
    }

    pub fn count(&self, pa: PhysAddr) -> usize {
        self.counts.get(&pa).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_release_reports_ownership() {
        let mut shared = SharedFrames::new();
        let pa = PhysAddr(0x8000_3000);
        shared.insert(pa);
        shared.acquire(pa);
        assert_eq!(shared.count(pa), 2);
        assert!(!shared.release(pa));
        assert!(shared.release(pa));
        assert_eq!(shared.count(pa), 0);
        assert!(shared.is_empty());
    }

    #[test]
    fn untracked_release_frees_nothing() {
        let mut shared = SharedFrames::new();
        assert!(!shared.release(PhysAddr(0x8000_0000)));
    }
}
