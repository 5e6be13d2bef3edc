use serde::{Deserialize, Serialize};

use crate::model::ItemId;

// --- Event enum: user intents forwarded by the shell ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    Mounted,
    RefreshRequested,

    // Create form
    NameChanged(String),
    DescriptionChanged(String),
    Submit,

    // List
    DeleteRequested {
        id: ItemId,
    },

    // Edit form
    EditRequested {
        id: ItemId,
    },
    EditNameChanged(String),
    EditDescriptionChanged(String),
    CommitEdit,
    CancelEdit,

    // Notices
    DismissNotice,
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Mounted => "mounted",
            Event::RefreshRequested => "refresh_requested",
            Event::NameChanged(_) => "name_changed",
            Event::DescriptionChanged(_) => "description_changed",
            Event::Submit => "submit",
            Event::DeleteRequested { .. } => "delete_requested",
            Event::EditRequested { .. } => "edit_requested",
            Event::EditNameChanged(_) => "edit_name_changed",
            Event::EditDescriptionChanged(_) => "edit_description_changed",
            Event::CommitEdit => "commit_edit",
            Event::CancelEdit => "cancel_edit",
            Event::DismissNotice => "dismiss_notice",
        }
    }
}
