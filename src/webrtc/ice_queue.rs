//! Bounded buffer for remote ICE candidates that arrive before the remote description

use std::collections::VecDeque;

use super::signaling::IceCandidate;

/// FIFO of candidates waiting for a remote description
///
/// Overflow drops the incoming (newest) candidate and leaves the queue intact.
#[derive(Debug)]
pub struct PendingIceQueue {
    items: VecDeque<IceCandidate>,
    capacity: usize,
    dropped: u64,
}

impl PendingIceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a candidate; returns `false` when the queue is full and it was dropped
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.items.push_back(candidate);
        true
    }

    /// Take every queued candidate in arrival order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of candidates dropped on overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
