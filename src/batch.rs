//! Batch construction
//!
//! A [`SendRequest`] is what the caller asks for; a [`BatchRequest`] is what
//! the agent receives. Building one assigns every recipient a fresh
//! [`MessageId`], which is the only key progress events are correlated by.

use crate::error::{PreconditionError, Result};
use crate::template;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Opaque batch token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Correlation id of a single message job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// A lead to be messaged.
///
/// `phone` is the delivery address; the other fields feed the template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub phone: String,
}

impl Recipient {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Delivery address with surrounding whitespace removed
    pub fn address(&self) -> &str {
        self.phone.trim()
    }

    /// Human-readable label: the name if present, otherwise the address
    pub fn label(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.address().to_string(),
        }
    }

    /// Placeholder values for [`template::render`]
    pub fn template_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        let pairs = [
            ("name", self.name.as_deref()),
            ("company", self.company.as_deref()),
            ("email", self.email.as_deref()),
            ("phone", Some(self.phone.as_str())),
        ];
        for (key, value) in pairs {
            if let Some(v) = value {
                fields.insert(key.to_string(), v.to_string());
            }
        }
        fields
    }
}

/// File sent alongside every message of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    /// Base64-encoded content
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = guess_mime(path);
        Ok(Self::from_bytes(file_name, mime_type, &bytes))
    }

    /// Decoded size in bytes, or `None` if `data` is not valid base64
    pub fn size(&self) -> Option<usize> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map(|b| b.len())
            .ok()
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

/// Who the batch is sent on behalf of
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Pacing instructions handed to the agent. The agent enforces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlePolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub per_minute_cap: u32,
}

impl ThrottlePolicy {
    pub fn validate(&self) -> std::result::Result<(), PreconditionError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(PreconditionError::InvalidThrottle(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if self.per_minute_cap == 0 {
            return Err(PreconditionError::InvalidThrottle(
                "per_minute_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 4_000,
            max_delay_ms: 9_000,
            per_minute_cap: 8,
        }
    }
}

/// Caller's request to message a list of recipients
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub template: String,
    pub attachments: Vec<Attachment>,
    pub recipients: Vec<Recipient>,
    /// Falls back to the configured default when `None`
    pub throttle: Option<ThrottlePolicy>,
    pub dry_run: bool,
    pub sender: SenderIdentity,
}

/// One per-recipient job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub recipient_address: String,
    pub recipient_label: String,
    pub rendered_body: String,
}

/// The immutable payload handed to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: BatchId,
    pub messages: Vec<Message>,
    pub throttle: ThrottlePolicy,
    pub attachments: Vec<Attachment>,
    pub sender: SenderIdentity,
    pub dry_run: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl BatchRequest {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Turns a [`SendRequest`] into a [`BatchRequest`]
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    dry_run_limit: usize,
    default_throttle: ThrottlePolicy,
}

impl BatchBuilder {
    pub fn new(dry_run_limit: usize, default_throttle: ThrottlePolicy) -> Self {
        Self {
            dry_run_limit,
            default_throttle,
        }
    }

    /// Validate and build a batch.
    ///
    /// Recipients with a blank address are skipped. A dry run keeps only the
    /// first `dry_run_limit` of the remaining recipients.
    pub fn build(&self, request: &SendRequest) -> Result<BatchRequest> {
        let throttle = request.throttle.unwrap_or(self.default_throttle);
        throttle.validate()?;

        let mut deliverable: Vec<&Recipient> = request
            .recipients
            .iter()
            .filter(|r| {
                let keep = !r.address().is_empty();
                if !keep {
                    tracing::warn!(label = %r.label(), "Skipping recipient without an address");
                }
                keep
            })
            .collect();

        if deliverable.is_empty() {
            return Err(PreconditionError::NoRecipients.into());
        }

        if request.dry_run && deliverable.len() > self.dry_run_limit {
            deliverable.truncate(self.dry_run_limit);
        }

        if template::placeholders_in(&request.template).is_empty() {
            tracing::debug!("Template has no recognized placeholders; every message is identical");
        }

        let messages = deliverable
            .into_iter()
            .map(|r| Message {
                id: MessageId::new(),
                recipient_address: r.address().to_string(),
                recipient_label: r.label(),
                rendered_body: template::render(&request.template, &r.template_fields()),
            })
            .collect();

        Ok(BatchRequest {
            batch_id: BatchId::new(),
            messages,
            throttle,
            attachments: request.attachments.clone(),
            sender: request.sender.clone(),
            dry_run: request.dry_run,
            created_at: chrono::Utc::now(),
        })
    }
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self::new(3, ThrottlePolicy::default())
    }
}
