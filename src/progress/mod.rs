//! Progress module: per-batch counters and the rolling event log
//!
//! The aggregator owns the delivery state of every message in the active
//! batch, keyed by message id. Counts only ever move when a message reaches
//! a terminal status for the first time, so `sent + failed + pending` always
//! equals `total`.

pub mod log;

pub use log::{EventLog, EventLogEntry, DEFAULT_CAPACITY, MAX_CAPACITY};

use crate::agent::{MessageStatus, ProgressEvent};
use crate::batch::{BatchRequest, Message, MessageId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of batch progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendProgress {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub pending: usize,
    pub is_active: bool,
    pub is_paused: bool,
}

impl SendProgress {
    /// Fresh, active progress for a batch of `total` messages
    pub fn started(total: usize) -> Self {
        Self {
            total,
            sent: 0,
            failed: 0,
            pending: total,
            is_active: true,
            is_paused: false,
        }
    }

    /// Counts add up and a paused batch is always active.
    pub fn is_consistent(&self) -> bool {
        self.sent + self.failed + self.pending == self.total && (!self.is_paused || self.is_active)
    }

    /// Fraction of messages with a final outcome, in `0.0..=1.0`
    pub fn completion(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.sent + self.failed) as f64 / self.total as f64
    }
}

impl std::fmt::Display for SendProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} sent, {} failed, {} pending",
            self.sent, self.total, self.failed, self.pending
        )?;
        if self.is_paused {
            write!(f, " (paused)")?;
        } else if !self.is_active {
            write!(f, " (inactive)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    message: Message,
    status: MessageStatus,
}

/// Applies agent progress events to one batch's counters and log
#[derive(Debug)]
pub struct ProgressAggregator {
    progress: SendProgress,
    tracked: HashMap<MessageId, Tracked>,
    log: EventLog,
}

impl ProgressAggregator {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            progress: SendProgress::default(),
            tracked: HashMap::new(),
            log: EventLog::new(log_capacity),
        }
    }

    /// Begin tracking a new batch. Clears the log and resets the counters.
    pub fn start(&mut self, batch: &BatchRequest) {
        self.tracked = batch
            .messages
            .iter()
            .map(|m| {
                (
                    m.id,
                    Tracked {
                        message: m.clone(),
                        status: MessageStatus::Pending,
                    },
                )
            })
            .collect();
        self.progress = SendProgress::started(batch.len());
        self.log.clear();
    }

    /// Apply one progress event. Returns true if counts changed.
    ///
    /// Events for unknown ids, for messages already in a terminal status,
    /// and `pending` events are ignored.
    pub fn apply(&mut self, event: &ProgressEvent) -> bool {
        let Some(tracked) = self.tracked.get_mut(&event.message_id) else {
            tracing::debug!(message_id = %event.message_id, "Progress for unknown message ignored");
            return false;
        };
        if !tracked.status.can_advance_to(event.status) {
            tracing::debug!(
                message_id = %event.message_id,
                from = %tracked.status,
                to = %event.status,
                "Out-of-order progress ignored"
            );
            return false;
        }

        tracked.status = event.status;
        match event.status {
            MessageStatus::Success => self.progress.sent += 1,
            MessageStatus::Failed => self.progress.failed += 1,
            _ => return false,
        }
        self.progress.pending = self.progress.pending.saturating_sub(1);

        self.log.push(EventLogEntry {
            id: event.message_id,
            recipient_label: tracked.message.recipient_label.clone(),
            address: tracked.message.recipient_address.clone(),
            status: event.status,
            error: event.error.clone(),
            confirmation_meta: event.confirmation_meta.clone(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Adopt the agent's final totals, clamped to the batch size.
    pub fn reconcile(&mut self, sent: usize, failed: usize) {
        let total = self.progress.total;
        let sent = sent.min(total);
        let failed = failed.min(total - sent);
        if sent != self.progress.sent || failed != self.progress.failed {
            tracing::debug!(
                observed_sent = self.progress.sent,
                observed_failed = self.progress.failed,
                sent,
                failed,
                "Agent totals differ from observed progress"
            );
        }
        self.progress.sent = sent;
        self.progress.failed = failed;
        self.progress.pending = total - sent - failed;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.progress.is_paused = paused && self.progress.is_active;
    }

    /// Mark the batch inactive, leaving counts untouched.
    pub fn deactivate(&mut self) {
        self.progress.is_active = false;
        self.progress.is_paused = false;
    }

    pub fn progress(&self) -> SendProgress {
        self.progress
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Current status of a tracked message
    pub fn status_of(&self, id: &MessageId) -> Option<MessageStatus> {
        self.tracked.get(id).map(|t| t.status)
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchBuilder, BatchId, Recipient, SendRequest};

    fn batch(n: usize) -> BatchRequest {
        BatchBuilder::default()
            .build(&SendRequest {
                template: "Hola {name}".to_string(),
                recipients: (0..n)
                    .map(|i| Recipient::new(format!("+52155500{:02}", i)).with_name(format!("Lead {}", i)))
                    .collect(),
                ..Default::default()
            })
            .unwrap()
    }

    fn event(batch: &BatchRequest, index: usize, status: MessageStatus) -> ProgressEvent {
        ProgressEvent {
            batch_id: batch.batch_id,
            message_id: batch.messages[index].id,
            status,
            error: (status == MessageStatus::Failed).then(|| "unreachable".to_string()),
            confirmation_meta: None,
        }
    }

    #[test]
    fn test_start_initializes_progress() {
        let batch = batch(4);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        assert_eq!(agg.progress(), SendProgress::started(4));
        assert!(agg.progress().is_consistent());
        assert!(agg.log().is_empty());
    }

    #[test]
    fn test_success_and_failure_counts() {
        let batch = batch(5);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        for i in 0..3 {
            assert!(agg.apply(&event(&batch, i, MessageStatus::Success)));
            assert!(agg.progress().is_consistent());
        }
        for i in 3..5 {
            assert!(agg.apply(&event(&batch, i, MessageStatus::Failed)));
            assert!(agg.progress().is_consistent());
        }

        let p = agg.progress();
        assert_eq!((p.sent, p.failed, p.pending), (3, 2, 0));
        assert_eq!(agg.log().len(), 5);
        let newest = agg.log().iter().next().unwrap();
        assert_eq!(newest.status, MessageStatus::Failed);
        assert_eq!(newest.error.as_deref(), Some("unreachable"));
    }

    #[test]
    fn test_duplicate_success_ignored() {
        let batch = batch(2);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        assert!(agg.apply(&event(&batch, 0, MessageStatus::Success)));
        assert!(!agg.apply(&event(&batch, 0, MessageStatus::Success)));
        assert!(!agg.apply(&event(&batch, 0, MessageStatus::Failed)));

        let p = agg.progress();
        assert_eq!((p.sent, p.failed, p.pending), (1, 0, 1));
        assert_eq!(agg.log().len(), 1);
    }

    #[test]
    fn test_sending_updates_status_only() {
        let batch = batch(1);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        assert!(!agg.apply(&event(&batch, 0, MessageStatus::Sending)));
        assert_eq!(agg.status_of(&batch.messages[0].id), Some(MessageStatus::Sending));
        assert_eq!(agg.progress(), SendProgress::started(1));
        assert!(agg.log().is_empty());

        assert!(!agg.apply(&event(&batch, 0, MessageStatus::Pending)));
        assert!(agg.apply(&event(&batch, 0, MessageStatus::Success)));
    }

    #[test]
    fn test_unknown_message_ignored() {
        let batch = batch(2);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        let stray = ProgressEvent {
            batch_id: BatchId::new(),
            message_id: MessageId::new(),
            status: MessageStatus::Success,
            error: None,
            confirmation_meta: None,
        };
        assert!(!agg.apply(&stray));
        assert_eq!(agg.progress(), SendProgress::started(2));
    }

    #[test]
    fn test_label_resolved_by_id_with_shared_address() {
        let batch = BatchBuilder::default()
            .build(&SendRequest {
                template: "Hi {name}".to_string(),
                recipients: vec![
                    Recipient::new("+5215550000").with_name("Ana"),
                    Recipient::new("+5215550000").with_name("Beto"),
                ],
                ..Default::default()
            })
            .unwrap();
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        agg.apply(&event(&batch, 1, MessageStatus::Success));
        agg.apply(&event(&batch, 0, MessageStatus::Success));

        let labels: Vec<_> = agg.log().iter().map(|e| e.recipient_label.clone()).collect();
        assert_eq!(labels, vec!["Ana", "Beto"]);
    }

    #[test]
    fn test_log_bounded_at_capacity() {
        let batch = batch(51);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);

        for i in 0..51 {
            agg.apply(&event(&batch, i, MessageStatus::Success));
            assert!(agg.log().len() <= 50);
        }
        assert_eq!(agg.progress().sent, 51);
        assert!(!agg.log().contains(&batch.messages[0].id));
        assert!(agg.log().contains(&batch.messages[50].id));
    }

    #[test]
    fn test_reconcile_clamps_totals() {
        let batch = batch(5);
        let mut agg = ProgressAggregator::default();
        agg.start(&batch);
        agg.apply(&event(&batch, 0, MessageStatus::Success));

        agg.reconcile(3, 2);
        let p = agg.progress();
        assert_eq!((p.sent, p.failed, p.pending), (3, 2, 0));

        agg.reconcile(9, 9);
        let p = agg.progress();
        assert_eq!((p.sent, p.failed, p.pending), (5, 0, 0));
        assert!(p.is_consistent());

        agg.reconcile(1, 1);
        assert_eq!(agg.progress().pending, 3);
    }

    #[test]
    fn test_pause_requires_active() {
        let batch = batch(1);
        let mut agg = ProgressAggregator::default();
        agg.set_paused(true);
        assert!(!agg.progress().is_paused);

        agg.start(&batch);
        agg.set_paused(true);
        assert!(agg.progress().is_paused);

        agg.deactivate();
        let p = agg.progress();
        assert!(!p.is_active && !p.is_paused);
        assert!(p.is_consistent());
    }

    #[test]
    fn test_display_and_completion() {
        let mut p = SendProgress::started(4);
        p.sent = 2;
        p.failed = 1;
        p.pending = 1;
        assert_eq!(p.to_string(), "2/4 sent, 1 failed, 1 pending");
        assert!((p.completion() - 0.75).abs() < f64::EPSILON);

        p.is_paused = true;
        assert!(p.to_string().ends_with("(paused)"));
        assert_eq!(SendProgress::default().completion(), 1.0);
    }
}
