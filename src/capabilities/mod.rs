//! Persistence collaborators.
//!
//! The editor never talks to a backend directly. It is handed an
//! `Arc<dyn Collaborator>` scoped to the owning screen; the three demo
//! back ends (offline datastore, GraphQL, REST) all implement the same trait.

#[cfg(not(target_arch = "wasm32"))]
mod datastore;
mod graphql;
mod http;
mod memory;
mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Item, ItemId, Version};
use crate::ErrorKind;

#[cfg(not(target_arch = "wasm32"))]
pub use self::datastore::{DataStoreCollaborator, SyncError, SyncReport};
pub use self::graphql::GraphQlCollaborator;
pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ReqwestTransport, ValidatedUrl,
};
pub use self::memory::{MemoryCollaborator, Op};
pub use self::rest::RestCollaborator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    DataStore,
    GraphQl,
    Rest,
    Memory,
}

impl CollaboratorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataStore => "datastore",
            Self::GraphQl => "graphql",
            Self::Rest => "rest",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("stale version {version:?} for todo {id}")]
    Conflict { id: ItemId, version: Option<Version> },

    #[error("todo {0} not found")]
    NotFound(ItemId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rejected ({status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },

    #[error("unexpected response shape: {0}")]
    Schema(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Transport(#[from] HttpError),
}

impl CollaboratorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Authentication,
            Self::Rejected {
                status: Some(status),
                ..
            } => ErrorKind::from_http_status(*status),
            Self::Rejected { status: None, .. } => ErrorKind::Validation,
            Self::Schema(_) => ErrorKind::Serialization,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Transport(e) => e.kind(),
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Maps a non-2xx HTTP answer onto the collaborator taxonomy.
    #[must_use]
    pub fn from_status(status: u16, message: String, id: Option<&ItemId>, version: Option<Version>) -> Self {
        match (ErrorKind::from_http_status(status), id) {
            (ErrorKind::Conflict, Some(id)) => Self::Conflict {
                id: id.clone(),
                version,
            },
            (ErrorKind::NotFound, Some(id)) => Self::NotFound(id.clone()),
            (ErrorKind::Authentication, _) => Self::Unauthorized(message),
            _ => Self::Rejected {
                status: Some(status),
                message,
            },
        }
    }
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Schema(e.to_string())
    }
}

/// Backend capability used by the editor.
///
/// `update` and `delete` take the caller's version token; collaborators
/// without concurrency control ignore it, the others answer
/// [`CollaboratorError::Conflict`] when it is stale.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn kind(&self) -> CollaboratorKind;

    async fn fetch_all(&self) -> Result<Vec<Item>, CollaboratorError>;

    async fn fetch_by_id(&self, id: &ItemId) -> Result<Option<Item>, CollaboratorError>;

    async fn create(&self, name: &str, description: Option<&str>) -> Result<Item, CollaboratorError>;

    async fn update(
        &self,
        id: &ItemId,
        version: Option<Version>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Item, CollaboratorError>;

    async fn delete(&self, id: &ItemId, version: Option<Version>) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_with_id() {
        let id = ItemId::new("t1");
        assert_eq!(
            CollaboratorError::from_status(409, "stale".into(), Some(&id), Some(Version(2))),
            CollaboratorError::Conflict {
                id: id.clone(),
                version: Some(Version(2))
            }
        );
        assert_eq!(
            CollaboratorError::from_status(404, "gone".into(), Some(&id), None),
            CollaboratorError::NotFound(id)
        );
    }

    #[test]
    fn test_status_mapping_without_id() {
        let err = CollaboratorError::from_status(409, "stale".into(), None, None);
        assert!(matches!(err, CollaboratorError::Rejected { status: Some(409), .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = CollaboratorError::from_status(403, "nope".into(), None, None);
        assert!(matches!(err, CollaboratorError::Unauthorized(_)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(CollaboratorError::Network("down".into()).kind(), ErrorKind::Network);
        assert!(CollaboratorError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!CollaboratorError::Schema("bad".into()).is_retryable());
        assert!(CollaboratorError::Conflict {
            id: ItemId::new("x"),
            version: None
        }
        .is_conflict());
    }
}
