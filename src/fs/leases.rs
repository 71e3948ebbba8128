//! Per-file Leases
//!
//! Open handles reserve their remote file for their whole lifetime: many
//! readers, or exactly one writer. A conflicting open is refused rather than
//! queued, since FUSE callbacks run on a single session thread.

use std::collections::HashMap;

use tracing::debug;

use crate::api::QuickKey;
use crate::cache::AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    Readers(u32),
    Writer,
}

/// Read/write reservations keyed by quick key
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<QuickKey, Lease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a file for an open handle
    ///
    /// # Returns
    /// false if the reservation conflicts with an existing one
    pub fn acquire(&mut self, quick_key: &QuickKey, mode: AccessMode) -> bool {
        let current = self.leases.get(quick_key).copied();
        let next = match (current, mode) {
            (None, AccessMode::ReadOnly) => Lease::Readers(1),
            (None, AccessMode::ReadWrite) => Lease::Writer,
            (Some(Lease::Readers(n)), AccessMode::ReadOnly) => Lease::Readers(n + 1),
            (Some(held), _) => {
                debug!(quick_key = %quick_key, held = ?held, requested = ?mode, "Lease conflict");
                return false;
            }
        };
        self.leases.insert(quick_key.clone(), next);
        true
    }

    /// Drop a reservation taken with [`LeaseTable::acquire`]
    pub fn release(&mut self, quick_key: &QuickKey, mode: AccessMode) {
        match (self.leases.get(quick_key).copied(), mode) {
            (Some(Lease::Readers(n)), AccessMode::ReadOnly) if n > 1 => {
                self.leases.insert(quick_key.clone(), Lease::Readers(n - 1));
            }
            (Some(Lease::Readers(_)), AccessMode::ReadOnly)
            | (Some(Lease::Writer), AccessMode::ReadWrite) => {
                self.leases.remove(quick_key);
            }
            (held, _) => {
                debug!(quick_key = %quick_key, held = ?held, "Release without matching lease");
            }
        }
    }

    #[cfg(test)]
    fn is_held(&self, quick_key: &QuickKey) -> bool {
        self.leases.contains_key(quick_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> QuickKey {
        QuickKey::new("abcdefghijk").unwrap()
    }

    #[test]
    fn test_many_readers() {
        let mut leases = LeaseTable::new();
        assert!(leases.acquire(&key(), AccessMode::ReadOnly));
        assert!(leases.acquire(&key(), AccessMode::ReadOnly));

        leases.release(&key(), AccessMode::ReadOnly);
        assert!(leases.is_held(&key()));
        leases.release(&key(), AccessMode::ReadOnly);
        assert!(!leases.is_held(&key()));
    }

    #[test]
    fn test_writer_excludes_everyone() {
        let mut leases = LeaseTable::new();
        assert!(leases.acquire(&key(), AccessMode::ReadWrite));
        assert!(!leases.acquire(&key(), AccessMode::ReadWrite));
        assert!(!leases.acquire(&key(), AccessMode::ReadOnly));

        leases.release(&key(), AccessMode::ReadWrite);
        assert!(leases.acquire(&key(), AccessMode::ReadOnly));
    }

    #[test]
    fn test_reader_blocks_writer() {
        let mut leases = LeaseTable::new();
        assert!(leases.acquire(&key(), AccessMode::ReadOnly));
        assert!(!leases.acquire(&key(), AccessMode::ReadWrite));

        let other = QuickKey::new("zyxwvutsrqp").unwrap();
        assert!(leases.acquire(&other, AccessMode::ReadWrite));
    }

    #[test]
    fn test_mismatched_release_is_ignored() {
        let mut leases = LeaseTable::new();
        assert!(leases.acquire(&key(), AccessMode::ReadWrite));
        leases.release(&key(), AccessMode::ReadOnly);
        assert!(leases.is_held(&key()));
    }
}
