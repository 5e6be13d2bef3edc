use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Collaborator, CollaboratorError, CollaboratorKind};
use crate::event::Event;
use crate::model::{Draft, Item, ItemId, ListEntry, LocalId, Notice, SyncState};
use crate::ErrorKind;

pub const MSG_NAME_REQUIRED: &str = "Todo requires name";
pub const MSG_ADDED: &str = "Todo added successfully!";
pub const MSG_DELETED: &str = "Todo deleted successfully!";
pub const MSG_UPDATED: &str = "Todo updated successfully!";
pub const MSG_NO_CHANGES: &str = "No changes to save";

// --- Configuration ---

/// What happens to an optimistic change the collaborator rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave the list as the user left it; a later refresh reconciles.
    #[default]
    KeepLocal,
    /// Undo the change: failed creates are removed, failed deletes restored.
    Rollback,
}

/// Where `begin_edit` takes the initial buffer from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditSource {
    #[default]
    Fetch,
    Cached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub failure_policy: FailurePolicy,
    pub edit_source: EditSource,
}

// --- Errors ---

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EditorError {
    #[error("{0}")]
    Validation(String),

    #[error("no todo is being edited")]
    NotEditing,

    #[error("todo {0} not found")]
    NotFound(ItemId),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl EditorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            EditorError::Validation(_) | EditorError::NotEditing => ErrorKind::Validation,
            EditorError::NotFound(_) => ErrorKind::NotFound,
            EditorError::Collaborator(e) => e.kind(),
        }
    }

    fn notice_message(&self, action: Action) -> String {
        match self {
            EditorError::Validation(reason) => reason.clone(),
            EditorError::NotEditing => "No todo is being edited".to_string(),
            EditorError::NotFound(_) => "Todo not found".to_string(),
            EditorError::Collaborator(e) if e.is_conflict() => {
                ErrorKind::Conflict.user_facing_message().to_string()
            }
            EditorError::Collaborator(e) => match action {
                Action::Fetch => format!("Error fetching todos: {e}"),
                Action::Create => "Error trying to add todo".to_string(),
                Action::Delete => "Error deleting todo".to_string(),
                Action::BeginEdit => "Error loading todo".to_string(),
                Action::CommitEdit => "Error updating todo".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Fetch,
    Create,
    Delete,
    BeginEdit,
    CommitEdit,
}

impl Action {
    const fn as_str(self) -> &'static str {
        match self {
            Action::Fetch => "fetch",
            Action::Create => "create",
            Action::Delete => "delete",
            Action::BeginEdit => "begin_edit",
            Action::CommitEdit => "commit_edit",
        }
    }
}

// --- State ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditMode {
    #[default]
    Idle,
    Editing { target: ItemId, buffer: Draft },
}

impl EditMode {
    #[must_use]
    pub fn target(&self) -> Option<&ItemId> {
        match self {
            EditMode::Idle => None,
            EditMode::Editing { target, .. } => Some(target),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorState {
    pub items: Vec<ListEntry>,
    pub pending_input: Draft,
    pub edit: EditMode,
    pub notice: Option<Notice>,
}

impl EditorState {
    fn entry_mut(&mut self, local_id: &LocalId) -> Option<&mut ListEntry> {
        self.items.iter_mut().find(|e| &e.local_id == local_id)
    }

    fn fail(&mut self, action: Action, error: &EditorError) {
        warn!(
            action = action.as_str(),
            code = error.kind().code(),
            error = %error,
            "editor operation failed"
        );
        self.notice = Some(Notice::error(error.notice_message(action)));
    }
}

/// Render snapshot handed to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewModel {
    pub items: Vec<ListEntry>,
    pub pending_input: Draft,
    pub edit: EditMode,
    pub notice: Option<Notice>,
    pub pending_count: usize,
    pub failed_count: usize,
}

impl From<&EditorState> for ViewModel {
    fn from(state: &EditorState) -> Self {
        let count = |sync: SyncState| state.items.iter().filter(|e| e.sync == sync).count();
        Self {
            items: state.items.clone(),
            pending_input: state.pending_input.clone(),
            edit: state.edit.clone(),
            notice: state.notice.clone(),
            pending_count: count(SyncState::Pending),
            failed_count: count(SyncState::Failed),
        }
    }
}

// --- Editor ---

/// Optimistic list editor over an injected [`Collaborator`].
///
/// Every operation applies its local change first, then awaits the
/// collaborator without holding the state lock. Failures never propagate:
/// each one becomes a notice. Overlapping operations are allowed; the last
/// write to a field wins.
///
/// The editor lives until [`unmount`](Self::unmount). After that, in-flight
/// collaborator calls are abandoned and no state changes.
pub struct Editor {
    collaborator: Arc<dyn Collaborator>,
    config: EditorConfig,
    state: RwLock<EditorState>,
    loaded: AtomicBool,
    lifetime: CancellationToken,
}

impl Editor {
    pub fn new(collaborator: Arc<dyn Collaborator>, config: EditorConfig) -> Self {
        Self {
            collaborator,
            config,
            state: RwLock::new(EditorState::default()),
            loaded: AtomicBool::new(false),
            lifetime: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> EditorConfig {
        self.config
    }

    #[must_use]
    pub fn collaborator_kind(&self) -> CollaboratorKind {
        self.collaborator.kind()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        !self.lifetime.is_cancelled()
    }

    pub async fn view(&self) -> ViewModel {
        ViewModel::from(&*self.state.read().await)
    }

    pub async fn snapshot(&self) -> EditorState {
        self.state.read().await.clone()
    }

    /// Races a collaborator call against unmount. `None` once unmounted.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Option<Result<T, CollaboratorError>> {
        tokio::select! {
            biased;
            () = self.lifetime.cancelled() => {
                debug!("editor unmounted, collaborator call abandoned");
                None
            }
            result = request => Some(result),
        }
    }

    /// Mutates state unless unmounted. The check happens under the write lock.
    async fn apply<R>(&self, f: impl FnOnce(&mut EditorState) -> R) -> Option<R> {
        let mut state = self.state.write().await;
        if self.lifetime.is_cancelled() {
            return None;
        }
        Some(f(&mut *state))
    }

    async fn report(&self, action: Action, error: EditorError) {
        self.apply(|s| s.fail(action, &error)).await;
    }

    /// Mount fetch. Only the first call reaches the collaborator.
    #[instrument(skip(self), fields(collaborator = self.collaborator.kind().as_str()))]
    pub async fn load(&self) {
        if self.loaded.swap(true, Ordering::SeqCst) {
            debug!("todos already loaded");
            return;
        }
        self.fetch().await;
    }

    /// Re-fetches and replaces the list, dropping unconfirmed local changes.
    #[instrument(skip(self), fields(collaborator = self.collaborator.kind().as_str()))]
    pub async fn refresh(&self) {
        self.loaded.store(true, Ordering::SeqCst);
        self.fetch().await;
    }

    async fn fetch(&self) {
        let Some(result) = self.call(self.collaborator.fetch_all()).await else {
            return;
        };
        match result {
            Ok(items) => {
                let count = items.len();
                self.apply(|s| s.items = items.into_iter().map(ListEntry::synced).collect())
                    .await;
                info!(count, "todos loaded");
            }
            Err(e) => self.report(Action::Fetch, e.into()).await,
        }
    }

    /// Creates from the form's pending input.
    pub async fn submit(&self) {
        let draft = self.state.read().await.pending_input.clone();
        self.create(draft.name, draft.description).await;
    }

    #[instrument(skip_all, fields(collaborator = self.collaborator.kind().as_str()))]
    pub async fn create(&self, name: impl Into<String>, description: impl Into<String>) {
        let draft = Draft::new(name, description);
        if let Err(reason) = draft.validate() {
            self.report(Action::Create, EditorError::Validation(reason.to_string()))
                .await;
            return;
        }

        let entry = ListEntry::pending(Item::unsaved(&draft));
        let local_id = entry.local_id.clone();
        let appended = self
            .apply(|s| {
                s.items.push(entry);
                s.pending_input = Draft::default();
            })
            .await;
        if appended.is_none() {
            return;
        }

        let description = draft.description_opt();
        let Some(result) = self
            .call(self.collaborator.create(&draft.name, description.as_deref()))
            .await
        else {
            return;
        };

        let policy = self.config.failure_policy;
        self.apply(|s| match result {
            Ok(item) => {
                debug!(id = ?item.id, "todo created");
                match s.entry_mut(&local_id) {
                    Some(entry) => {
                        entry.item = item;
                        entry.sync = SyncState::Synced;
                    }
                    None => debug!(local_id = %local_id, "created entry no longer listed"),
                }
                s.notice = Some(Notice::success(MSG_ADDED));
            }
            Err(e) => {
                match policy {
                    FailurePolicy::KeepLocal => {
                        if let Some(entry) = s.entry_mut(&local_id) {
                            entry.sync = SyncState::Failed;
                        }
                    }
                    FailurePolicy::Rollback => s.items.retain(|e| e.local_id != local_id),
                }
                s.fail(Action::Create, &e.into());
            }
        })
        .await;
    }

    #[instrument(skip(self), fields(collaborator = self.collaborator.kind().as_str()))]
    pub async fn delete(&self, id: &ItemId) {
        let Some(removed) = self
            .apply(|s| {
                let index = s.items.iter().position(|e| e.has_id(id))?;
                Some((index, s.items.remove(index)))
            })
            .await
        else {
            return;
        };
        if removed.is_none() {
            debug!(%id, "deleting a todo that is not listed");
        }

        let version = removed.as_ref().and_then(|(_, entry)| entry.item.version);
        let Some(result) = self.call(self.collaborator.delete(id, version)).await else {
            return;
        };

        let policy = self.config.failure_policy;
        self.apply(|s| match result {
            Ok(()) => s.notice = Some(Notice::success(MSG_DELETED)),
            Err(e) => {
                if let (FailurePolicy::Rollback, Some((index, entry))) = (policy, removed) {
                    let index = index.min(s.items.len());
                    s.items.insert(index, entry);
                }
                s.fail(Action::Delete, &e.into());
            }
        })
        .await;
    }

    #[instrument(skip(self), fields(source = ?self.config.edit_source))]
    pub async fn begin_edit(&self, id: &ItemId) {
        let buffer = match self.config.edit_source {
            EditSource::Cached => self
                .state
                .read()
                .await
                .items
                .iter()
                .find(|e| e.has_id(id))
                .map(|e| e.item.to_draft())
                .ok_or_else(|| EditorError::NotFound(id.clone())),
            EditSource::Fetch => match self.call(self.collaborator.fetch_by_id(id)).await {
                None => return,
                Some(Ok(Some(item))) => Ok(item.to_draft()),
                Some(Ok(None)) => Err(EditorError::NotFound(id.clone())),
                Some(Err(e)) => Err(e.into()),
            },
        };

        self.apply(|s| match buffer {
            Ok(buffer) => {
                s.edit = EditMode::Editing {
                    target: id.clone(),
                    buffer,
                };
            }
            Err(e) => s.fail(Action::BeginEdit, &e),
        })
        .await;
    }

    #[instrument(skip(self), fields(collaborator = self.collaborator.kind().as_str()))]
    pub async fn commit_edit(&self) {
        let edit = self.state.read().await.edit.clone();
        let EditMode::Editing { target, buffer } = edit else {
            self.report(Action::CommitEdit, EditorError::NotEditing).await;
            return;
        };
        if let Err(reason) = buffer.validate() {
            self.report(Action::CommitEdit, EditorError::Validation(reason.to_string()))
                .await;
            return;
        }

        let current = match self.call(self.collaborator.fetch_by_id(&target)).await {
            None => return,
            Some(Ok(Some(item))) => item,
            Some(Ok(None)) => {
                self.report(Action::CommitEdit, EditorError::NotFound(target)).await;
                return;
            }
            Some(Err(e)) => {
                self.report(Action::CommitEdit, e.into()).await;
                return;
            }
        };

        if current.matches_draft(&buffer) {
            debug!(%target, "edit buffer matches stored todo");
            self.apply(|s| s.notice = Some(Notice::warning(MSG_NO_CHANGES)))
                .await;
            return;
        }

        let description = buffer.description_opt();
        let Some(result) = self
            .call(self.collaborator.update(
                &target,
                current.version,
                &buffer.name,
                description.as_deref(),
            ))
            .await
        else {
            return;
        };

        self.apply(|s| match result {
            Ok(updated) => {
                if let Some(entry) = s.items.iter_mut().find(|e| e.has_id(&target)) {
                    entry.item.name = updated.name;
                    entry.item.description = updated.description;
                    entry.item.version = updated.version;
                    entry.sync = SyncState::Synced;
                }
                if s.edit.target() == Some(&target) {
                    s.edit = EditMode::Idle;
                }
                s.notice = Some(Notice::success(MSG_UPDATED));
            }
            Err(e) => s.fail(Action::CommitEdit, &e.into()),
        })
        .await;
    }

    pub async fn cancel_edit(&self) {
        self.apply(|s| s.edit = EditMode::Idle).await;
    }

    pub async fn dismiss_notice(&self) {
        self.apply(|s| s.notice = None).await;
    }

    /// Clears the notice once its display time has passed. Returns whether it did.
    pub async fn expire_notice(&self, now_ms: u64) -> bool {
        self.apply(|s| {
            let expired = s.notice.as_ref().is_some_and(|n| n.is_expired(now_ms));
            if expired {
                s.notice = None;
            }
            expired
        })
        .await
        .unwrap_or(false)
    }

    pub async fn set_pending_input(&self, draft: Draft) {
        self.apply(|s| s.pending_input = draft).await;
    }

    /// Replaces the edit buffer. Ignored while idle.
    pub async fn set_edit_buffer(&self, draft: Draft) {
        self.edit_buffer(|buffer| *buffer = draft).await;
    }

    async fn edit_buffer(&self, f: impl FnOnce(&mut Draft)) {
        self.apply(|s| match &mut s.edit {
            EditMode::Editing { buffer, .. } => f(buffer),
            EditMode::Idle => debug!("edit input ignored while idle"),
        })
        .await;
    }

    /// Routes a shell intent to the matching operation.
    ///
    /// This is the core's update entry point: the shell forwards every
    /// [`Event`] here and re-renders from [`view`](Self::view) afterwards.
    #[instrument(skip(self, event), fields(event = event.name()))]
    pub async fn dispatch(&self, event: Event) {
        match event {
            Event::Mounted => self.load().await,
            Event::RefreshRequested => self.refresh().await,
            Event::NameChanged(name) => {
                self.apply(|s| s.pending_input.name = name).await;
            }
            Event::DescriptionChanged(description) => {
                self.apply(|s| s.pending_input.description = description)
                    .await;
            }
            Event::Submit => self.submit().await,
            Event::DeleteRequested { id } => self.delete(&id).await,
            Event::EditRequested { id } => self.begin_edit(&id).await,
            Event::EditNameChanged(name) => self.edit_buffer(|b| b.name = name).await,
            Event::EditDescriptionChanged(description) => {
                self.edit_buffer(|b| b.description = description).await;
            }
            Event::CommitEdit => self.commit_edit().await,
            Event::CancelEdit => self.cancel_edit().await,
            Event::DismissNotice => self.dismiss_notice().await,
        }
    }

    /// Ends the editor's lifetime. Returns once no mutation can follow.
    pub async fn unmount(&self) {
        self.lifetime.cancel();
        let _quiesce = self.state.write().await;
        info!("editor unmounted");
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}
