//! Out-of-process agent bridge
//!
//! Spawns the agent binary and talks NDJSON over its stdin/stdout. Query
//! replies (`hello_ack`, `session_status`) are matched to their request by
//! `request_id`; progress and completion lines are published to the
//! [`EventHub`]. Commands are queued to a writer task that owns stdin, so a
//! caller never waits on a full pipe. The process is spawned lazily and
//! respawned by the next presence check after it exits.

use super::hub::{EventHub, Subscription};
use super::protocol::{AgentCommand, AgentEvent, AgentMessage, AgentPresence};
use super::AgentBridge;
use crate::batch::BatchRequest;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};

/// Name looked up on `PATH` when no binary is configured
pub const AGENT_BINARY: &str = "massdispatch-agent";

/// Longest line accepted from the agent
const MAX_LINE_BYTES: usize = 1024 * 1024;

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<QueryReply>>>>;

/// Reply to a presence or session query
#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryReply {
    Hello { version: String },
    Session { authenticated: bool },
}

/// Live agent process
struct Connection {
    /// Serialized command lines, drained by the writer task
    commands: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    // Held so the process is killed when the connection is replaced
    _child: Child,
}

/// [`AgentBridge`] backed by a child process
pub struct ProcessAgent {
    config: AgentConfig,
    hub: EventHub,
    connection: Mutex<Option<Connection>>,
    pending: PendingReplies,
}

impl ProcessAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            hub: EventHub::new(),
            connection: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether an agent process is currently running
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Spawn the agent unless a live process already exists.
    async fn ensure_connected(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.alive.load(Ordering::SeqCst) {
                return Ok(());
            }
            tracing::info!("Agent process is gone; respawning");
        }

        let binary = resolve_agent_binary(&self.config)?;
        tracing::info!(binary = %binary.display(), "Spawning messaging agent");

        let mut child = Command::new(&binary)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Agent(format!(
                    "Failed to spawn agent at {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Agent("Agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("Agent stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "massdispatch::agent_stderr", "{}", line);
                }
            });
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.spawn_reader(stdout, alive.clone());
        let commands = spawn_writer(stdin, alive.clone());

        *guard = Some(Connection {
            commands,
            alive,
            _child: child,
        });
        Ok(())
    }

    fn spawn_reader(&self, stdout: ChildStdout, alive: Arc<AtomicBool>) {
        let hub = self.hub.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<AgentMessage>(trimmed) {
                            Ok(msg) => route_message(&hub, &pending, msg).await,
                            Err(e) => {
                                tracing::warn!("Failed to parse agent line '{}': {}", trimmed, e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Agent stdout read error: {}", e);
                    }
                }
            }

            alive.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiting query with "no reply"
            pending.lock().await.clear();
            tracing::warn!("Agent process closed its output");
        });
    }

    /// Queue a command for the writer task. Returns once queued, not once
    /// the agent has read it.
    async fn write_command(&self, command: &AgentCommand) -> Result<()> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');

        let guard = self.connection.lock().await;
        let conn = match guard.as_ref() {
            Some(c) if c.alive.load(Ordering::SeqCst) => c,
            _ => return Err(Error::Agent("Agent is not running".to_string())),
        };

        if conn.commands.send(line).is_err() {
            conn.alive.store(false, Ordering::SeqCst);
            return Err(Error::Agent("Agent writer has stopped".to_string()));
        }
        Ok(())
    }

    /// Send a query and wait for its correlated reply.
    async fn query(&self, request_id: String, command: AgentCommand) -> Option<QueryReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(e) = self.write_command(&command).await {
            tracing::warn!(request_id = %request_id, "Agent query not sent: {}", e);
            self.pending.lock().await.remove(&request_id);
            return None;
        }

        match tokio::time::timeout(self.config.reply_timeout(), rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(request_id = %request_id, "Agent query timed out");
                self.pending.lock().await.remove(&request_id);
                None
            }
        }
    }
}

/// Drain queued command lines into the agent's stdin until the queue closes
/// or a write fails.
fn spawn_writer(mut stdin: ChildStdin, alive: Arc<AtomicBool>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!("Failed to write to agent: {}", e);
                alive.store(false, Ordering::SeqCst);
                break;
            }
        }
        tracing::debug!("Agent writer stopped");
    });
    tx
}

/// Dispatch one parsed agent line.
async fn route_message(hub: &EventHub, pending: &PendingReplies, msg: AgentMessage) {
    match msg {
        AgentMessage::HelloAck {
            request_id,
            version,
        } => resolve_query(pending, &request_id, QueryReply::Hello { version }).await,
        AgentMessage::SessionStatus {
            request_id,
            authenticated,
        } => resolve_query(pending, &request_id, QueryReply::Session { authenticated }).await,
        AgentMessage::Progress(progress) => {
            hub.publish(AgentEvent::Progress(progress));
        }
        AgentMessage::BatchDone(done) => {
            hub.publish(AgentEvent::BatchDone(done));
        }
        AgentMessage::Error { message } => {
            tracing::warn!("Agent reported an error: {}", message);
        }
        AgentMessage::KeepAlive => {}
    }
}

async fn resolve_query(pending: &PendingReplies, request_id: &str, reply: QueryReply) {
    match pending.lock().await.remove(request_id) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => tracing::debug!(request_id, "Reply for unknown or expired agent query"),
    }
}

#[async_trait]
impl AgentBridge for ProcessAgent {
    async fn detect_agent(&self) -> AgentPresence {
        if let Err(e) = self.ensure_connected().await {
            tracing::info!("Agent not available: {}", e);
            return AgentPresence::unavailable();
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        match self
            .query(request_id.clone(), AgentCommand::Hello { request_id })
            .await
        {
            Some(QueryReply::Hello { version }) => AgentPresence::available(version),
            _ => AgentPresence::unavailable(),
        }
    }

    async fn check_session_active(&self) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        matches!(
            self.query(request_id.clone(), AgentCommand::SessionStatus { request_id })
                .await,
            Some(QueryReply::Session {
                authenticated: true
            })
        )
    }

    async fn send_batch(&self, batch: &BatchRequest) -> Result<()> {
        self.write_command(&AgentCommand::SendBatch {
            batch: batch.clone(),
        })
        .await
    }

    async fn pause_batch(&self) -> Result<()> {
        self.write_command(&AgentCommand::PauseBatch).await
    }

    async fn resume_batch(&self) -> Result<()> {
        self.write_command(&AgentCommand::ResumeBatch).await
    }

    async fn cancel_batch(&self) -> Result<()> {
        self.write_command(&AgentCommand::CancelBatch).await
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }
}

/// Locate the agent binary: configured path, then `PATH`, then common
/// install locations.
fn resolve_agent_binary(config: &AgentConfig) -> Result<PathBuf> {
    if let Some(ref path) = config.binary {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(Error::Agent(format!(
            "Configured agent binary not found: {}",
            path.display()
        )));
    }

    if let Ok(output) = std::process::Command::new("which").arg(AGENT_BINARY).output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".massdispatch").join("bin").join(AGENT_BINARY),
        PathBuf::from("/usr/local/bin").join(AGENT_BINARY),
        PathBuf::from("/opt/homebrew/bin").join(AGENT_BINARY),
    ];

    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }

    Err(Error::Agent(format!(
        "{} not found. Install the messaging agent or set agent.binary",
        AGENT_BINARY
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::{BatchDoneEvent, MessageStatus, ProgressEvent};
    use crate::batch::{BatchBuilder, BatchId, MessageId, Recipient, SendRequest};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Shell stand-in for the agent: answers hello/session queries and
    /// reports a fixed batch as done when it receives `send_batch`.
    fn script_agent(dir: &TempDir, authenticated: bool, done_batch: Option<BatchId>) -> AgentConfig {
        let done_line = done_batch
            .map(|id| {
                let id = serde_json::to_value(id).unwrap();
                format!(
                    r#"printf '%s\n' '{{"type":"batch_done","batch_id":{},"sent":2,"failed":1}}'"#,
                    id
                )
            })
            .unwrap_or_else(|| ":".to_string());

        let script = format!(
            r#"printf '%s\n' 'this is not json'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"type":"hello"'*) printf '{{"type":"hello_ack","request_id":"%s","version":"9.9.9"}}\n' "$id" ;;
    *'"type":"session_status"'*) printf '{{"type":"session_status","request_id":"%s","authenticated":{}}}\n' "$id" ;;
    *'"type":"send_batch"'*) {} ;;
  esac
done
"#,
            authenticated, done_line
        );
        let path = dir.path().join("agent.sh");
        std::fs::write(&path, script).unwrap();

        AgentConfig {
            binary: Some(PathBuf::from("/bin/sh")),
            args: vec![path.to_string_lossy().to_string()],
            reply_timeout_ms: 5_000,
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let agent = ProcessAgent::new(AgentConfig {
            binary: Some(PathBuf::from("/nonexistent/massdispatch-agent")),
            ..Default::default()
        });
        let presence = agent.detect_agent().await;
        assert!(!presence.available);
        assert!(presence.version.is_none());
        assert!(!agent.check_session_active().await);
    }

    #[tokio::test]
    async fn test_commands_fail_when_not_running() {
        let agent = ProcessAgent::new(AgentConfig::default());
        let err = agent.pause_batch().await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_and_session_via_script() {
        let dir = TempDir::new().unwrap();
        let agent = ProcessAgent::new(script_agent(&dir, true, None));

        let presence = agent.detect_agent().await;
        assert_eq!(presence, AgentPresence::available("9.9.9"));
        assert!(agent.is_connected().await);
        assert!(agent.check_session_active().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unauthenticated_session() {
        let dir = TempDir::new().unwrap();
        let agent = ProcessAgent::new(script_agent(&dir, false, None));

        assert!(agent.detect_agent().await.available);
        assert!(!agent.check_session_active().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_done_line_reaches_subscriber() {
        let dir = TempDir::new().unwrap();
        let fixed = BatchId::new();
        let agent = ProcessAgent::new(script_agent(&dir, true, Some(fixed)));
        let mut sub = agent.subscribe();

        assert!(agent.detect_agent().await.available);
        let batch = BatchBuilder::default()
            .build(&SendRequest {
                template: "hi".into(),
                recipients: vec![Recipient::new("+5215550000")],
                ..Default::default()
            })
            .unwrap();
        agent.send_batch(&batch).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            AgentEvent::BatchDone(BatchDoneEvent {
                batch_id: fixed,
                sent: 2,
                failed: 1,
            })
        );
    }

    /// Answers hello and session, then stops reading stdin.
    #[cfg(unix)]
    fn deaf_agent(dir: &TempDir) -> AgentConfig {
        let script = r#"for kind in hello session; do
  IFS= read -r line
  id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
  case "$kind" in
    hello) printf '{"type":"hello_ack","request_id":"%s","version":"1.0.0"}\n' "$id" ;;
    session) printf '{"type":"session_status","request_id":"%s","authenticated":true}\n' "$id" ;;
  esac
done
sleep 30
"#;
        let path = dir.path().join("deaf-agent.sh");
        std::fs::write(&path, script).unwrap();

        AgentConfig {
            binary: Some(PathBuf::from("/bin/sh")),
            args: vec![path.to_string_lossy().to_string()],
            reply_timeout_ms: 5_000,
        }
    }

    /// A batch larger than the pipe buffer
    fn oversized_request() -> SendRequest {
        SendRequest {
            template: "hi".into(),
            attachments: vec![crate::batch::Attachment::from_bytes(
                "catalog.pdf",
                "application/pdf",
                &vec![0x5a; 512 * 1024],
            )],
            recipients: vec![Recipient::new("+5215550000")],
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_commands_do_not_wait_for_a_full_pipe() {
        let dir = TempDir::new().unwrap();
        let agent = ProcessAgent::new(deaf_agent(&dir));

        assert!(agent.detect_agent().await.available);
        assert!(agent.check_session_active().await);

        let batch = BatchBuilder::default().build(&oversized_request()).unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(2), agent.send_batch(&batch)).await;
        assert!(matches!(sent, Ok(Ok(()))));

        let cancelled = tokio::time::timeout(Duration::from_secs(1), agent.cancel_batch()).await;
        assert!(matches!(cancelled, Ok(Ok(()))));
        let connected = tokio::time::timeout(Duration::from_secs(1), agent.is_connected()).await;
        assert_eq!(connected.ok(), Some(true));
    }

    #[tokio::test]
    async fn test_route_progress_publishes() {
        let hub = EventHub::new();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let mut sub = hub.subscribe();

        let progress = ProgressEvent {
            batch_id: BatchId::new(),
            message_id: MessageId::new(),
            status: MessageStatus::Success,
            error: None,
            confirmation_meta: Some("wamid.HBgM".to_string()),
        };
        route_message(&hub, &pending, AgentMessage::Progress(progress.clone())).await;
        assert_eq!(sub.recv().await, Some(AgentEvent::Progress(progress)));
    }

    #[tokio::test]
    async fn test_route_reply_resolves_pending_query() {
        let hub = EventHub::new();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("r1".to_string(), tx);

        route_message(
            &hub,
            &pending,
            AgentMessage::SessionStatus {
                request_id: "r1".to_string(),
                authenticated: true,
            },
        )
        .await;

        assert_eq!(
            rx.await.unwrap(),
            QueryReply::Session {
                authenticated: true
            }
        );
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_unknown_reply_ignored() {
        let hub = EventHub::new();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        route_message(
            &hub,
            &pending,
            AgentMessage::HelloAck {
                request_id: "stale".to_string(),
                version: "1.0".to_string(),
            },
        )
        .await;
        assert!(pending.lock().await.is_empty());
    }
}
