// lib.rs - Headless core for the optimistic Todo screens

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod counter;
pub mod editor;
pub mod event;
pub mod model;
pub mod outbox;
pub mod screen;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use capabilities::{Collaborator, CollaboratorError, CollaboratorKind};
pub use config::{BackendConfig, ConfigError};
pub use counter::Counter;
pub use editor::{EditMode, EditSource, Editor, EditorConfig, EditorError, FailurePolicy, ViewModel};
pub use event::Event;
pub use model::{Draft, Item, ItemId, ListEntry, LocalId, Notice, NoticeKind, SyncState, Version};
pub use screen::Screen;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const GRAPHQL_PAGE_LIMIT: u32 = 100;
pub const MAX_GRAPHQL_PAGES: usize = 50;
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 60000;
pub const JITTER_MAX_MS: u64 = 1000;
pub const SYNC_BATCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Storage,
    Serialization,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage
        )
    }

    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 | 403 => Self::Authentication,
            404 | 410 => Self::NotFound,
            409 | 412 => Self::Conflict,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn user_facing_message(self) -> &'static str {
        match self {
            Self::Network => "Unable to connect. Please check your internet connection and try again.",
            Self::Timeout => "The request timed out. Please try again.",
            Self::Authentication => "You are not allowed to do this. Please sign in again.",
            Self::Validation => "The backend rejected the request.",
            Self::NotFound => "The requested todo could not be found.",
            Self::Conflict => "This todo was changed elsewhere. Reload and try again.",
            Self::RateLimited => "Too many requests. Please wait a moment and try again.",
            Self::Storage => "Unable to save data locally.",
            Self::Serialization => "The backend sent data this app does not understand.",
            Self::Internal | Self::Unknown => "An unexpected error occurred. Please try again.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub const fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[must_use]
pub fn calculate_retry_delay(attempt: u32, jitter_ms: u64) -> u64 {
    let base = BASE_RETRY_DELAY_MS;
    let exponential = base.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exponential.min(MAX_RETRY_DELAY_MS);
    capped.saturating_add(jitter_ms)
}

#[must_use]
pub fn generate_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(get_current_time_ms());
    hasher.finish() % JITTER_MAX_MS
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
