//! # inflights
//!
//! why: bound the number of unacknowledged appends per follower
//! relations: owned by each Progress in progress.rs
//! what: Inflights sliding window keyed by the last index of each append

use crate::Index;
use std::collections::VecDeque;

/// Sliding window of outstanding append requests, oldest first. Each slot
/// holds the last entry index carried by that request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inflights {
    capacity: usize,
    slots: VecDeque<Index>,
}

impl Inflights {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a request whose last entry is `index`. Indices must be added in
    /// increasing order and never past capacity.
    pub fn add(&mut self, index: Index) {
        debug_assert!(!self.full(), "inflight window overflow");
        debug_assert!(self.slots.back().map_or(true, |last| *last < index));
        self.slots.push_back(index);
    }

    /// Free every request acknowledged by `index`.
    pub fn free_le(&mut self, index: Index) {
        while matches!(self.slots.front(), Some(front) if *front <= index) {
            self.slots.pop_front();
        }
    }

    /// Free the oldest request regardless of acknowledgment.
    pub fn free_first_one(&mut self) {
        self.slots.pop_front();
    }

    pub fn full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }
}
