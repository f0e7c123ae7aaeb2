//! Deadline queue for cooperative suspensions. The host sleeps until `next_deadline`
//! and then hands every due entry back to its state machine.

use std::time::Instant;

#[derive(Debug)]
pub struct Timers<T> {
    entries: Vec<(Instant, T)>,
}

impl<T> Timers<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn schedule(&mut self, at: Instant, timer: T) {
        let pos = self.entries.partition_point(|(t, _)| *t <= at);
        self.entries.insert(pos, (at, timer));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|(t, _)| *t)
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let n = self.entries.partition_point(|(t, _)| *t <= now);
        self.entries.drain(..n).map(|(_, timer)| timer).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self::new()
    }
}
