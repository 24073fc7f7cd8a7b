//! Per-initiator transfer lock
//!
//! At most one transfer may be in flight per initiator call. The lock is
//! taken when a transfer is created and given back when it reaches `ended`,
//! or when creation fails.
//!
//! Lock order: this lock spans a transfer's whole lifetime and is always
//! acquired *outside* the global state lock. Releasing it never blocks, so
//! transitions may release it while holding the state lock.

use dashmap::DashSet;
use tracing::debug;

#[derive(Debug, Default)]
pub struct TransferLock {
    held: DashSet<String>,
}

impl TransferLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a transfer already holds `initiator_call`
    pub fn acquire(&self, initiator_call: &str) -> bool {
        let acquired = self.held.insert(initiator_call.to_string());
        debug!(initiator_call, acquired, "Transfer lock acquire");
        acquired
    }

    pub fn release(&self, initiator_call: &str) {
        if self.held.remove(initiator_call).is_some() {
            debug!(initiator_call, "Transfer lock released");
        }
    }

    pub fn is_held(&self, initiator_call: &str) -> bool {
        self.held.contains(initiator_call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let lock = TransferLock::new();
        assert!(lock.acquire("chan-b"));
        assert!(!lock.acquire("chan-b"));
        assert!(lock.acquire("chan-x"));
        lock.release("chan-b");
        assert!(!lock.is_held("chan-b"));
        assert!(lock.acquire("chan-b"));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let lock = TransferLock::new();
        lock.release("nobody");
        assert!(!lock.is_held("nobody"));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let lock = Arc::new(TransferLock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || lock.acquire("chan-b"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
