//! In-process registry of block runs with a fetch in flight.
//!
//! A thread claims a run before taking the cross-process lock for it; a
//! second thread claiming an overlapping run waits until the first claim is
//! dropped. This keeps threads of one cache instance from racing on the same
//! blocks, whatever the semantics of the process-level lock.

use parking_lot::{Condvar, Mutex};

use crate::cache::range::BlockSpan;

#[derive(Default)]
pub struct PendingFetches {
    inflight: Mutex<Vec<BlockSpan>>,
    released: Condvar,
}

/// An exclusive claim on a block run, released on drop.
pub struct PendingClaim<'a> {
    registry: &'a PendingFetches,
    span: BlockSpan,
}

impl PendingFetches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `span`, blocking while any overlapping claim is held.
    pub fn claim(&self, span: BlockSpan) -> PendingClaim<'_> {
        let mut inflight = self.inflight.lock();
        while inflight.iter().any(|held| held.overlaps(&span)) {
            self.released.wait(&mut inflight);
        }
        inflight.push(span);
        PendingClaim {
            registry: self,
            span,
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        let mut inflight = self.registry.inflight.lock();
        if let Some(pos) = inflight.iter().position(|held| *held == self.span) {
            inflight.swap_remove(pos);
        }
        drop(inflight);
        self.registry.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_disjoint_claims_coexist() {
        let registry = PendingFetches::new();
        let a = registry.claim(BlockSpan::new(0, 2));
        let b = registry.claim(BlockSpan::new(2, 4));
        assert_eq!(registry.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_overlapping_claim_waits() {
        let registry = Arc::new(PendingFetches::new());
        let claim = registry.claim(BlockSpan::new(0, 4));
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let registry = Arc::clone(&registry);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _claim = registry.claim(BlockSpan::new(3, 5));
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(claim);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
