use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

/// Picks the upstream for a new gate connection.
pub trait HostSelector: Send + Sync {
    /// Index into a host list of `len` entries. Only called with `len > 0`.
    fn select(&self, len: usize) -> usize;
}

/// Cycles through the hosts in the order they were added.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelector for RoundRobin {
    fn select(&self, len: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Uniformly random host per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPick;

impl HostSelector for RandomPick {
    fn select(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}
