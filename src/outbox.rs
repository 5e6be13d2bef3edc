use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::capabilities::CollaboratorError;
use crate::{calculate_retry_delay, generate_jitter, UnixTimeMs, MAX_RETRY_ATTEMPTS};

// ============================================================================
// Identifiers
// ============================================================================

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), OutboxError> {
        if id.is_empty() {
            return Err(OutboxError::InvalidId("OpId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(OutboxError::InvalidId(format!(
                "OpId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OutboxError::InvalidId(
                "OpId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<String> for OpId {
    type Error = OutboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OpId> for String {
    fn from(id: OpId) -> Self {
        id.0
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted entry: {op_id}, reason: {reason}")]
    CorruptedEntry { op_id: String, reason: String },
}

/// Why the last push of an entry failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntryError {
    pub code: String,
    pub message: Option<String>,
    pub is_permanent: bool,
}

impl OutboxEntryError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
            is_permanent: false,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        self.message = Some(message);
        self
    }

    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.is_permanent = true;
        self
    }
}

impl From<&CollaboratorError> for OutboxEntryError {
    fn from(error: &CollaboratorError) -> Self {
        let entry_error = Self::new(error.kind().code()).with_message(error.to_string());
        if error.is_retryable() {
            entry_error
        } else {
            entry_error.permanent()
        }
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

// ============================================================================
// Intents
// ============================================================================

/// A local change to one todo that still has to reach the remote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationIntent {
    Create {
        name: String,
        description: Option<String>,
    },
    Update {
        name: String,
        description: Option<String>,
    },
    Delete,
}

impl MutationIntent {
    #[must_use]
    pub fn intent_type(&self) -> &'static str {
        match self {
            MutationIntent::Create { .. } => "create",
            MutationIntent::Update { .. } => "update",
            MutationIntent::Delete => "delete",
        }
    }
}

// ============================================================================
// Outbox Entry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    #[default]
    Pending,
    Failed,
    PermanentlyFailed,
}

impl RetryState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::PermanentlyFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub op_id: OpId,
    /// Local id of the todo row the intent applies to.
    pub todo_id: String,
    pub intent: MutationIntent,
    pub created_at: UnixTimeMs,
    pub retry_state: RetryState,
    pub attempt_count: u32,
    pub next_retry_at: Option<UnixTimeMs>,
    pub last_error: Option<OutboxEntryError>,
}

impl OutboxEntry {
    #[must_use]
    pub fn new(todo_id: impl Into<String>, intent: MutationIntent) -> Self {
        Self {
            op_id: OpId::generate(),
            todo_id: todo_id.into(),
            intent,
            created_at: UnixTimeMs::now(),
            retry_state: RetryState::Pending,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn is_ready_for_retry(&self, now: UnixTimeMs) -> bool {
        match self.retry_state {
            RetryState::Pending => true,
            RetryState::Failed => self.next_retry_at.map_or(true, |t| now >= t),
            RetryState::PermanentlyFailed => false,
        }
    }

    #[must_use]
    pub const fn is_permanently_failed(&self) -> bool {
        self.retry_state.is_terminal()
    }

    pub fn mark_failed(&mut self, error: OutboxEntryError) {
        let now = UnixTimeMs::now();
        self.attempt_count = self.attempt_count.saturating_add(1);

        if error.is_permanent || self.attempt_count >= MAX_RETRY_ATTEMPTS {
            self.retry_state = RetryState::PermanentlyFailed;
            self.next_retry_at = None;
        } else {
            self.retry_state = RetryState::Failed;
            let jitter = generate_jitter();
            let delay = calculate_retry_delay(self.attempt_count - 1, jitter);
            self.next_retry_at = Some(now.add_millis(delay));
        }

        self.last_error = Some(error);
    }

    /// Dead-letters an entry whose earlier sibling for the same todo was dead-lettered.
    pub fn mark_blocked_by(&mut self, failed: &OpId) {
        self.retry_state = RetryState::PermanentlyFailed;
        self.next_retry_at = None;
        self.last_error = Some(
            OutboxEntryError::new("DEPENDENCY_FAILED")
                .with_message(format!("earlier operation {failed} failed permanently"))
                .permanent(),
        );
    }
}
