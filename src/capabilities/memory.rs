use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use super::{Collaborator, CollaboratorError, CollaboratorKind};
use crate::model::{Item, ItemId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FetchAll,
    FetchById,
    Create,
    Update,
    Delete,
}

#[derive(Default)]
struct MemoryState {
    items: Vec<Item>,
    next_id: u64,
}

/// In-process backend with the same semantics as the real ones.
///
/// Used for previews and offline demos, and in tests where it doubles as a
/// failure-injectable fake: failures can be armed per operation, every call
/// is recorded, and creates can be held back to simulate a slow network.
pub struct MemoryCollaborator {
    versioned: bool,
    state: Mutex<MemoryState>,
    failures: Mutex<HashMap<Op, CollaboratorError>>,
    calls: Mutex<Vec<Op>>,
    hold_creates: AtomicBool,
    release: Notify,
}

impl Default for MemoryCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCollaborator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            versioned: true,
            state: Mutex::new(MemoryState::default()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hold_creates: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    /// A backend without concurrency tokens, like the REST API.
    #[must_use]
    pub fn without_versions() -> Self {
        Self {
            versioned: false,
            ..Self::new()
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a stored item directly, bypassing call recording.
    pub fn seed(&self, name: &str, description: Option<&str>) -> Item {
        let mut state = Self::lock(&self.state);
        let item = self.new_item(&mut state, name, description);
        state.items.push(item.clone());
        item
    }

    /// Simulates another client editing the stored item.
    pub fn modify_remote(&self, id: &ItemId, name: &str, description: Option<&str>) -> Option<Item> {
        let mut state = Self::lock(&self.state);
        let versioned = self.versioned;
        let item = state.items.iter_mut().find(|i| i.id.as_ref() == Some(id))?;
        item.name = name.to_string();
        item.description = description.map(str::to_string);
        if versioned {
            item.version = item.version.map(Version::next);
        }
        Some(item.clone())
    }

    /// Arms a failure returned by every call to `op` until cleared.
    pub fn fail(&self, op: Op, error: CollaboratorError) {
        Self::lock(&self.failures).insert(op, error);
    }

    pub fn clear_failures(&self) {
        Self::lock(&self.failures).clear();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Op> {
        Self::lock(&self.calls).clone()
    }

    #[must_use]
    pub fn call_count(&self, op: Op) -> usize {
        Self::lock(&self.calls).iter().filter(|c| **c == op).count()
    }

    #[must_use]
    pub fn stored(&self) -> Vec<Item> {
        Self::lock(&self.state).items.clone()
    }

    /// Makes subsequent creates wait for [`Self::release_create`].
    pub fn hold_creates(&self) {
        self.hold_creates.store(true, Ordering::SeqCst);
    }

    /// Lets one held create proceed.
    pub fn release_create(&self) {
        self.release.notify_one();
    }

    fn new_item(&self, state: &mut MemoryState, name: &str, description: Option<&str>) -> Item {
        state.next_id += 1;
        Item {
            id: Some(ItemId::new(format!("todo-{}", state.next_id))),
            name: name.to_string(),
            description: description.map(str::to_string),
            version: self.versioned.then_some(Version::INITIAL),
        }
    }

    fn record(&self, op: Op) -> Result<(), CollaboratorError> {
        Self::lock(&self.calls).push(op);
        match Self::lock(&self.failures).get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn check_version(&self, stored: &Item, id: &ItemId, version: Option<Version>) -> Result<(), CollaboratorError> {
        if self.versioned && stored.version != version {
            return Err(CollaboratorError::Conflict {
                id: id.clone(),
                version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Collaborator for MemoryCollaborator {
    fn kind(&self) -> CollaboratorKind {
        CollaboratorKind::Memory
    }

    async fn fetch_all(&self) -> Result<Vec<Item>, CollaboratorError> {
        self.record(Op::FetchAll)?;
        Ok(self.stored())
    }

    async fn fetch_by_id(&self, id: &ItemId) -> Result<Option<Item>, CollaboratorError> {
        self.record(Op::FetchById)?;
        Ok(Self::lock(&self.state)
            .items
            .iter()
            .find(|i| i.id.as_ref() == Some(id))
            .cloned())
    }

    async fn create(&self, name: &str, description: Option<&str>) -> Result<Item, CollaboratorError> {
        Self::lock(&self.calls).push(Op::Create);
        if self.hold_creates.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if let Some(error) = Self::lock(&self.failures).get(&Op::Create) {
            return Err(error.clone());
        }
        let mut state = Self::lock(&self.state);
        let item = self.new_item(&mut state, name, description);
        state.items.push(item.clone());
        Ok(item)
    }

    async fn update(
        &self,
        id: &ItemId,
        version: Option<Version>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Item, CollaboratorError> {
        self.record(Op::Update)?;
        let mut state = Self::lock(&self.state);
        let stored = state
            .items
            .iter_mut()
            .find(|i| i.id.as_ref() == Some(id))
            .ok_or_else(|| CollaboratorError::NotFound(id.clone()))?;
        self.check_version(stored, id, version)?;
        stored.name = name.to_string();
        stored.description = description.map(str::to_string);
        stored.version = stored.version.map(Version::next);
        Ok(stored.clone())
    }

    async fn delete(&self, id: &ItemId, version: Option<Version>) -> Result<(), CollaboratorError> {
        self.record(Op::Delete)?;
        let mut state = Self::lock(&self.state);
        let index = state
            .items
            .iter()
            .position(|i| i.id.as_ref() == Some(id))
            .ok_or_else(|| CollaboratorError::NotFound(id.clone()))?;
        self.check_version(&state.items[index], id, version)?;
        state.items.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_assigns_id_and_version() {
        let backend = MemoryCollaborator::new();
        let item = backend.create("Buy milk", None).await.unwrap();
        assert_eq!(item.id, Some(ItemId::new("todo-1")));
        assert_eq!(item.version, Some(Version::INITIAL));
        assert_eq!(backend.calls(), vec![Op::Create]);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let backend = MemoryCollaborator::new();
        let item = backend.seed("A", None);
        let id = item.id.clone().unwrap();
        backend.modify_remote(&id, "A2", None);

        let result = backend.update(&id, item.version, "A3", None).await;
        assert!(matches!(result, Err(CollaboratorError::Conflict { .. })));

        let result = backend.delete(&id, item.version).await;
        assert!(matches!(result, Err(CollaboratorError::Conflict { .. })));
        assert_eq!(backend.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_unversioned_ignores_tokens() {
        let backend = MemoryCollaborator::without_versions();
        let item = backend.seed("A", None);
        assert_eq!(item.version, None);
        let id = item.id.unwrap();
        let updated = backend.update(&id, Some(Version(42)), "B", Some("d")).await.unwrap();
        assert_eq!(updated.name, "B");
        backend.delete(&id, None).await.unwrap();
        assert!(backend.stored().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_persists_until_cleared() {
        let backend = MemoryCollaborator::new();
        backend.fail(Op::FetchAll, CollaboratorError::Network("down".into()));
        assert!(backend.fetch_all().await.is_err());
        assert!(backend.fetch_all().await.is_err());
        backend.clear_failures();
        assert!(backend.fetch_all().await.is_ok());
        assert_eq!(backend.call_count(Op::FetchAll), 3);
    }
}
