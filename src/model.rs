use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::get_current_time_ms;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(ItemId);
typed_id!(LocalId);

impl LocalId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Optimistic-concurrency token. Collaborators bump it on every accepted write.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// --- Item ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub id: Option<ItemId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<Version>,
}

impl Item {
    /// An item that has not been persisted yet.
    #[must_use]
    pub fn unsaved(draft: &Draft) -> Self {
        Self {
            id: None,
            name: draft.name.clone(),
            description: draft.description_opt(),
            version: None,
        }
    }

    #[must_use]
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Absent and empty descriptions are the same thing to the form.
    #[must_use]
    pub fn matches_draft(&self, draft: &Draft) -> bool {
        self.name == draft.name && self.description_text() == draft.description
    }

    #[must_use]
    pub fn to_draft(&self) -> Draft {
        Draft::new(self.name.clone(), self.description_text())
    }
}

// --- Form fields ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Draft {
    pub name: String,
    pub description: String,
}

impl Draft {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.name.trim().is_empty()
    }

    /// Checks the required name. Returns the reason shown to the user.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.is_blank() {
            return Err("Todo requires name");
        }
        Ok(())
    }

    #[must_use]
    pub fn description_opt(&self) -> Option<String> {
        if self.description.is_empty() {
            None
        } else {
            Some(self.description.clone())
        }
    }
}

// --- List entries ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Applied locally, collaborator call in flight.
    Pending,
    #[default]
    Synced,
    /// The collaborator rejected the change; kept until the next fetch.
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub local_id: LocalId,
    pub item: Item,
    pub sync: SyncState,
}

impl ListEntry {
    #[must_use]
    pub fn pending(item: Item) -> Self {
        Self {
            local_id: LocalId::generate(),
            item,
            sync: SyncState::Pending,
        }
    }

    #[must_use]
    pub fn synced(item: Item) -> Self {
        Self {
            local_id: LocalId::generate(),
            item,
            sync: SyncState::Synced,
        }
    }

    #[must_use]
    pub fn has_id(&self, id: &ItemId) -> bool {
        self.item.id.as_ref() == Some(id)
    }
}

// --- Notices ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub kind: NoticeKind,
    pub created_at_ms: u64,
    pub duration_ms: u64,
}

impl Notice {
    pub fn new(message: impl Into<String>, kind: NoticeKind) -> Self {
        Self {
            message: message.into(),
            kind,
            created_at_ms: get_current_time_ms(),
            duration_ms: kind.default_duration_ms(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, NoticeKind::Error)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, NoticeKind::Success)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(message, NoticeKind::Warning)
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_requires_trimmed_name() {
        assert_eq!(Draft::new("", "").validate(), Err("Todo requires name"));
        assert_eq!(Draft::new("   \t", "desc").validate(), Err("Todo requires name"));
        assert!(Draft::new(" Buy milk ", "").validate().is_ok());
    }

    #[test]
    fn test_long_text_is_valid() {
        assert!(Draft::new("x".repeat(300), "").validate().is_ok());
        assert!(Draft::new("ok", "y".repeat(10_000)).validate().is_ok());
    }

    #[test]
    fn test_empty_description_is_absent() {
        let item = Item::unsaved(&Draft::new("Buy milk", ""));
        assert_eq!(item.description, None);
        assert_eq!(item.description_text(), "");
        assert!(item.matches_draft(&Draft::new("Buy milk", "")));
    }

    #[test]
    fn test_matches_draft_detects_changes() {
        let item = Item {
            id: Some(ItemId::new("1")),
            name: "A".into(),
            description: Some("first".into()),
            version: Some(Version(3)),
        };
        assert!(item.matches_draft(&Draft::new("A", "first")));
        assert!(!item.matches_draft(&Draft::new("A", "")));
        assert!(!item.matches_draft(&Draft::new("B", "first")));
    }

    #[test]
    fn test_version_next() {
        assert_eq!(Version::INITIAL.next(), Version(2));
        assert_eq!(Version(u64::MAX).next(), Version(u64::MAX));
    }

    #[test]
    fn test_notice_expiry() {
        let notice = Notice::new("hi", NoticeKind::Success);
        assert_eq!(notice.duration_ms, 2000);
        assert!(!notice.is_expired(notice.created_at_ms + 2000));
        assert!(notice.is_expired(notice.created_at_ms + 2001));
    }

    #[test]
    fn test_item_wire_shape() {
        let item: Item = serde_json::from_str(r#"{"id":"abc","name":"A"}"#).unwrap();
        assert_eq!(item.id, Some(ItemId::new("abc")));
        assert_eq!(item.description, None);
        assert_eq!(item.version, None);
    }
}
