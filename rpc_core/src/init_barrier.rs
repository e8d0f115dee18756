//! Staged cross-compartment startup barrier.
//!
//! A cascading handshake: compartment `i` busy-waits on compartment
//! `i-1`'s counter advancing past a snapshot, then itself
//! busy-increments its own counter until the global `initialized` flag
//! is set. Each handshake point uses explicit acquire/release so the
//! ordering holds without relying on plain volatile reads.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// `{initialized, counters[N]}` in shared memory, used exactly once at
/// boot.
pub struct InitBarrier {
    initialized: AtomicBool,
    counters: Vec<AtomicU64>,
}

impl InitBarrier {
    pub fn new(n: u16) -> Self {
        let mut counters = Vec::with_capacity(n as usize);
        counters.resize_with(n as usize, || AtomicU64::new(0));
        InitBarrier {
            initialized: AtomicBool::new(false),
            counters,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Compartment 0's (the app compartment's) side: runs
    /// `init_shared_region`, then busy-increments its own counter until
    /// compartment `N-1` advances past the pre-init snapshot, then
    /// releases every other compartment.
    pub fn enter_app_compartment(&self, init_shared_region: impl FnOnce()) {
        let last = self.counters.len() - 1;
        let snapshot = self.counters[last].load(Ordering::Acquire);
        init_shared_region();
        while self.counters[last].load(Ordering::Acquire) == snapshot {
            self.counters[0].fetch_add(1, Ordering::Release);
        }
        self.initialized.store(true, Ordering::Release);
    }

    /// Compartment `i` (`i > 0`)'s side: busy-waits on compartment
    /// `i-1`'s counter changing, then busy-increments its own counter
    /// until the barrier is released.
    pub fn enter_compartment(&self, comp_id: u16) {
        assert!(comp_id > 0, "compartment 0 must call enter_app_compartment");
        let i = comp_id as usize;
        let snapshot = self.counters[i - 1].load(Ordering::Acquire);
        while self.counters[i - 1].load(Ordering::Acquire) == snapshot {
            core::hint::spin_loop();
        }
        while !self.is_initialized() {
            self.counters[i].fetch_add(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_compartment_releases_itself() {
        let barrier = InitBarrier::new(1);
        barrier.enter_app_compartment(|| {});
        assert!(barrier.is_initialized());
    }

    #[test]
    fn cascading_handshake_releases_all_compartments() {
        let n = 4u16;
        let barrier = Arc::new(InitBarrier::new(n));
        let mut handles = Vec::new();
        for i in 1..n {
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                b.enter_compartment(i);
            }));
        }
        barrier.enter_app_compartment(|| {});
        for h in handles {
            h.join().unwrap();
        }
        assert!(barrier.is_initialized());
    }
}
