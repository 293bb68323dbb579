//! In-process stand-in for the delivery agent
//!
//! Walks a batch in order, honouring the throttle policy (scaled by a pace
//! factor), pause/resume and cancel, and reports every message through the
//! same [`EventHub`] a real agent would. Addresses that do not look like an
//! international phone number, or that were marked with
//! [`SimulatedAgent::fail_address`], are reported as failed.

use super::hub::{EventHub, Subscription};
use super::protocol::{AgentEvent, AgentPresence, BatchDoneEvent, MessageStatus, ProgressEvent};
use super::AgentBridge;
use crate::batch::{BatchRequest, Message, ThrottlePolicy};
use crate::error::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RunControl {
    paused: bool,
    cancelled: bool,
}

/// Simulated [`AgentBridge`]
pub struct SimulatedAgent {
    hub: EventHub,
    available: AtomicBool,
    session_active: AtomicBool,
    pace: f64,
    failing: Arc<Mutex<HashSet<String>>>,
    run: Mutex<Option<watch::Sender<RunControl>>>,
}

impl SimulatedAgent {
    /// Agent that paces messages exactly as the throttle policy says
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(),
            available: AtomicBool::new(true),
            session_active: AtomicBool::new(true),
            pace: 1.0,
            failing: Arc::new(Mutex::new(HashSet::new())),
            run: Mutex::new(None),
        }
    }

    /// Multiply every delay by `pace` (0 = no delays)
    pub fn with_pace(mut self, pace: f64) -> Self {
        self.pace = pace.max(0.0);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::SeqCst);
    }

    /// Report deliveries to `address` as failed
    pub fn fail_address(&self, address: impl Into<String>) {
        self.lock_failing().insert(address.into());
    }

    /// Publish an arbitrary event, as if the agent had emitted it
    pub fn emit(&self, event: AgentEvent) -> usize {
        self.hub.publish(event)
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.failing.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn update_run(&self, f: impl FnOnce(&mut RunControl)) {
        let run = self.run.lock().unwrap_or_else(|p| p.into_inner());
        match run.as_ref() {
            Some(tx) => {
                tx.send_modify(f);
            }
            None => tracing::debug!("Simulated agent has no batch running; control ignored"),
        }
    }
}

impl Default for SimulatedAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before the next message, honouring both the random delay window and
/// the per-minute cap.
fn next_delay(throttle: &ThrottlePolicy, pace: f64) -> Duration {
    if pace == 0.0 {
        return Duration::ZERO;
    }
    let jitter = if throttle.max_delay_ms > throttle.min_delay_ms {
        rand::thread_rng().gen_range(throttle.min_delay_ms..=throttle.max_delay_ms)
    } else {
        throttle.min_delay_ms
    };
    let cap_floor = 60_000 / u64::from(throttle.per_minute_cap.max(1));
    Duration::from_millis(jitter.max(cap_floor)).mul_f64(pace)
}

fn looks_deliverable(address: &str) -> bool {
    let digits = address.strip_prefix('+').unwrap_or(address);
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// Block while paused. Returns false if the run was cancelled (or the
/// controller went away).
async fn wait_runnable(control: &mut watch::Receiver<RunControl>) -> bool {
    loop {
        let state = *control.borrow_and_update();
        if state.cancelled {
            return false;
        }
        if !state.paused {
            return true;
        }
        if control.changed().await.is_err() {
            return false;
        }
    }
}

async fn run_batch(
    hub: EventHub,
    batch: BatchRequest,
    failing: HashSet<String>,
    pace: f64,
    mut control: watch::Receiver<RunControl>,
) {
    let batch_id = batch.batch_id;
    let mut sent = 0;
    let mut failed = 0;

    for (index, message) in batch.messages.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(next_delay(&batch.throttle, pace)).await;
        }
        if !wait_runnable(&mut control).await {
            tracing::info!(batch_id = %batch_id, "Simulated agent stopped: batch cancelled");
            return;
        }

        hub.publish(AgentEvent::Progress(progress(
            &batch,
            message,
            MessageStatus::Sending,
            None,
        )));

        let event = if failing.contains(&message.recipient_address)
            || !looks_deliverable(&message.recipient_address)
        {
            failed += 1;
            progress(
                &batch,
                message,
                MessageStatus::Failed,
                Some("recipient is not reachable on this platform".to_string()),
            )
        } else {
            sent += 1;
            let mut event = progress(&batch, message, MessageStatus::Success, None);
            event.confirmation_meta = Some(format!("sim-{}", uuid::Uuid::new_v4().simple()));
            event
        };
        hub.publish(AgentEvent::Progress(event));
    }

    hub.publish(AgentEvent::BatchDone(BatchDoneEvent {
        batch_id,
        sent,
        failed,
    }));
}

fn progress(
    batch: &BatchRequest,
    message: &Message,
    status: MessageStatus,
    error: Option<String>,
) -> ProgressEvent {
    ProgressEvent {
        batch_id: batch.batch_id,
        message_id: message.id,
        status,
        error,
        confirmation_meta: None,
    }
}

#[async_trait]
impl AgentBridge for SimulatedAgent {
    async fn detect_agent(&self) -> AgentPresence {
        if self.available.load(Ordering::SeqCst) {
            AgentPresence::available(format!("simulated-{}", env!("CARGO_PKG_VERSION")))
        } else {
            AgentPresence::unavailable()
        }
    }

    async fn check_session_active(&self) -> bool {
        self.available.load(Ordering::SeqCst) && self.session_active.load(Ordering::SeqCst)
    }

    async fn send_batch(&self, batch: &BatchRequest) -> Result<()> {
        let (tx, rx) = watch::channel(RunControl::default());
        {
            let mut run = self.run.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(previous) = run.replace(tx) {
                previous.send_modify(|c| c.cancelled = true);
            }
        }

        let failing = self.lock_failing().clone();
        tracing::info!(batch_id = %batch.batch_id, messages = batch.len(), "Simulated agent accepted batch");
        tokio::spawn(run_batch(self.hub.clone(), batch.clone(), failing, self.pace, rx));
        Ok(())
    }

    async fn pause_batch(&self) -> Result<()> {
        self.update_run(|c| c.paused = true);
        Ok(())
    }

    async fn resume_batch(&self) -> Result<()> {
        self.update_run(|c| c.paused = false);
        Ok(())
    }

    async fn cancel_batch(&self) -> Result<()> {
        self.update_run(|c| c.cancelled = true);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchBuilder, Recipient, SendRequest};

    fn batch(addresses: &[&str]) -> BatchRequest {
        BatchBuilder::default()
            .build(&SendRequest {
                template: "Hola {name}".to_string(),
                recipients: addresses.iter().map(|a| Recipient::new(*a)).collect(),
                throttle: Some(ThrottlePolicy {
                    min_delay_ms: 1_000,
                    max_delay_ms: 2_000,
                    per_minute_cap: 60,
                }),
                ..Default::default()
            })
            .unwrap()
    }

    async fn drain_until_done(sub: &mut Subscription) -> (Vec<ProgressEvent>, BatchDoneEvent) {
        let mut progress = Vec::new();
        loop {
            match sub.recv().await.expect("hub closed") {
                AgentEvent::Progress(p) => progress.push(p),
                AgentEvent::BatchDone(d) => return (progress, d),
            }
        }
    }

    #[test]
    fn test_next_delay_bounds() {
        let throttle = ThrottlePolicy {
            min_delay_ms: 1_000,
            max_delay_ms: 3_000,
            per_minute_cap: 120,
        };
        for _ in 0..50 {
            let d = next_delay(&throttle, 1.0);
            assert!(d >= Duration::from_millis(1_000) && d <= Duration::from_millis(3_000));
        }
        assert_eq!(next_delay(&throttle, 0.0), Duration::ZERO);
    }

    #[test]
    fn test_per_minute_cap_floor() {
        let throttle = ThrottlePolicy {
            min_delay_ms: 0,
            max_delay_ms: 0,
            per_minute_cap: 6,
        };
        assert_eq!(next_delay(&throttle, 1.0), Duration::from_secs(10));
    }

    #[test]
    fn test_looks_deliverable() {
        assert!(looks_deliverable("+5215550000"));
        assert!(looks_deliverable("5215550000"));
        assert!(!looks_deliverable("call me"));
        assert!(!looks_deliverable("+12"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_batch_to_completion() {
        let agent = SimulatedAgent::new();
        agent.fail_address("+5215550002");
        let mut sub = agent.subscribe();
        let batch = batch(&["+5215550001", "+5215550002", "not-a-phone"]);

        agent.send_batch(&batch).await.unwrap();
        let (progress, done) = drain_until_done(&mut sub).await;

        assert_eq!(done.batch_id, batch.batch_id);
        assert_eq!((done.sent, done.failed), (1, 2));
        let terminal: Vec<_> = progress.iter().filter(|p| p.status.is_terminal()).collect();
        assert_eq!(terminal.len(), 3);
        assert!(terminal[0].confirmation_meta.as_deref().unwrap().starts_with("sim-"));
        assert!(terminal[1].error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_run_without_done() {
        let agent = SimulatedAgent::new();
        let mut sub = agent.subscribe();
        let batch = batch(&["+5215550001", "+5215550002", "+5215550003"]);

        agent.send_batch(&batch).await.unwrap();
        // First message goes out immediately; cancel before the second.
        let first = sub.recv().await.unwrap();
        assert!(matches!(first, AgentEvent::Progress(ref p) if p.status == MessageStatus::Sending));
        agent.cancel_batch().await.unwrap();

        let mut events = Vec::new();
        while let Ok(Some(e)) = tokio::time::timeout(Duration::from_secs(60), sub.recv()).await {
            events.push(e);
        }
        // Only the in-flight first message completes
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AgentEvent::Progress(ref p) if p.status == MessageStatus::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_and_session() {
        let agent = SimulatedAgent::new();
        assert!(agent.detect_agent().await.available);
        assert!(agent.check_session_active().await);

        agent.set_session_active(false);
        assert!(!agent.check_session_active().await);

        agent.set_available(false);
        assert!(!agent.detect_agent().await.available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_without_batch_is_ok() {
        let agent = SimulatedAgent::new();
        assert!(agent.pause_batch().await.is_ok());
        assert!(agent.resume_batch().await.is_ok());
        assert!(agent.cancel_batch().await.is_ok());
    }
}
