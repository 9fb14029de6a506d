//! Deadline table keyed by purpose
//!
//! Each purpose holds at most one deadline. Scheduling replaces the previous
//! deadline for that purpose in one step, so a timer can never fire twice.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Scheduled deadlines, at most one per key
#[derive(Debug, Clone)]
pub struct Timers<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Copy + Eq + Hash> Timers<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Schedule `key` to fire `after` from `now`, replacing any earlier deadline
    pub fn schedule(&mut self, key: K, now: Instant, after: Duration) {
        self.deadlines.insert(key, now + after);
    }

    /// Cancel `key`. Returns true if it was armed.
    pub fn cancel(&mut self, key: K) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn deadline(&self, key: K) -> Option<Instant> {
        self.deadlines.get(&key).copied()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`, earliest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, *k))
            .collect();
        due.sort_by_key(|(at, _)| *at);

        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, k)| k).collect()
    }
}

impl<K: Copy + Eq + Hash> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}
