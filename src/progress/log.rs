//! Bounded rolling event log
//!
//! Keeps the most recent delivery outcomes for display and export. When the
//! log is full, pushing a new entry evicts the oldest one, so memory stays
//! bounded no matter how many events a batch produces.

use crate::agent::MessageStatus;
use crate::batch::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of entries retained.
pub const DEFAULT_CAPACITY: usize = 50;

/// Upper bound on the number of entries retained, whatever is configured.
pub const MAX_CAPACITY: usize = 50;

/// One delivery outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub id: MessageId,
    pub recipient_label: String,
    pub address: String,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub confirmation_meta: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Capacity-limited log, newest entry first.
#[derive(Debug, Clone)]
pub struct EventLog {
    /// front = newest, back = oldest
    entries: VecDeque<EventLogEntry>,
    capacity: usize,
}

impl EventLog {
    /// Create a log holding at most `capacity` entries, clamped to
    /// `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Insert as newest, evicting the oldest entry if at capacity.
    /// Returns the evicted entry's id if eviction occurred.
    pub fn push(&mut self, entry: EventLogEntry) -> Option<MessageId> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_back().map(|e| e.id)
        } else {
            None
        };
        self.entries.push_front(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|e| e.id == *id)
    }

    /// Entries, newest first
    pub fn iter(&self) -> impl Iterator<Item = &EventLogEntry> {
        self.entries.iter()
    }

    /// Owned copy of the entries, newest first
    pub fn snapshot(&self) -> Vec<EventLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
