#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;

use todo_core::capabilities::{Collaborator, DataStoreCollaborator, MemoryCollaborator, Op};
use todo_core::{CollaboratorError, Draft, Editor, EditorConfig, ItemId, Version};

fn names(items: &[todo_core::Item]) -> Vec<&str> {
    items.iter().map(|i| i.name.as_str()).collect()
}

#[tokio::test]
async fn offline_edits_sync_to_remote_and_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("todos.db");
    let store = Arc::new(DataStoreCollaborator::open(&path).unwrap());
    let remote = Arc::new(MemoryCollaborator::new());
    let editor = Editor::new(store.clone(), EditorConfig::default());
    editor.load().await;

    // 1. Local writes land immediately and queue for the remote
    editor.create("Buy milk", "").await;
    editor.create("Walk dog", "").await;
    assert_eq!(store.pending_mutations().await.unwrap(), 2);
    assert!(remote.stored().is_empty());

    // 2. First sync pushes both creates in order
    let report = store.sync(&*remote).await.unwrap();
    assert_eq!(report.pushed, 2);
    assert!(report.is_clean());
    assert_eq!(names(&remote.stored()), vec!["Buy milk", "Walk dog"]);
    assert_eq!(store.pending_mutations().await.unwrap(), 0);

    // 3. Edit one, delete the other, push again
    let view = editor.view().await;
    let milk = view.items[0].item.id.clone().unwrap();
    let dog = view.items[1].item.id.clone().unwrap();
    editor.begin_edit(&milk).await;
    editor.set_edit_buffer(Draft::new("Buy oat milk", "")).await;
    editor.commit_edit().await;
    editor.delete(&dog).await;
    assert_eq!(store.pending_mutations().await.unwrap(), 2);

    let report = store.sync(&*remote).await.unwrap();
    assert_eq!(report.pushed, 2);
    let stored = remote.stored();
    assert_eq!(names(&stored), vec!["Buy oat milk"]);
    assert_eq!(stored[0].version, Some(Version(2)));

    // 4. Another client renames it; pull brings the change down
    let remote_id = stored[0].id.clone().unwrap();
    remote.modify_remote(&remote_id, "Buy oat milk x2", None);
    assert_eq!(store.pull(&*remote).await.unwrap(), 1);
    editor.refresh().await;
    let view = editor.view().await;
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].item.name, "Buy oat milk x2");

    // 5. Restart: rows persist on disk
    editor.unmount().await;
    drop(editor);
    drop(store);
    let reopened = DataStoreCollaborator::open(&path).unwrap();
    let items = reopened.fetch_all().await.unwrap();
    assert_eq!(names(&items), vec!["Buy oat milk x2"]);
    assert_eq!(reopened.pending_mutations().await.unwrap(), 0);
}

#[tokio::test]
async fn rejected_push_is_dead_lettered_without_touching_local_rows() {
    let store = Arc::new(DataStoreCollaborator::open_in_memory().unwrap());
    let remote = Arc::new(MemoryCollaborator::new());
    let editor = Editor::new(store.clone(), EditorConfig::default());

    editor.create("Draft", "").await;
    store.sync(&*remote).await.unwrap();
    let id = editor.view().await.items[0].item.id.clone().unwrap();

    // 1. Remote refuses the update as stale
    remote.fail(
        Op::Update,
        CollaboratorError::Conflict {
            id: ItemId::new("todo-1"),
            version: Some(Version::INITIAL),
        },
    );
    editor.begin_edit(&id).await;
    editor.set_edit_buffer(Draft::new("Final", "")).await;
    editor.commit_edit().await;
    editor.delete(&id).await;

    // 2. The update dead-letters and takes the later delete with it
    let report = store.sync(&*remote).await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(store.pending_mutations().await.unwrap(), 0);
    assert_eq!(names(&remote.stored()), vec!["Draft"]);

    let dead = store.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].last_error.as_ref().unwrap().code, "CONFLICT");
    assert_eq!(dead[1].last_error.as_ref().unwrap().code, "DEPENDENCY_FAILED");

    // 3. Local state keeps the user's changes
    assert!(store.fetch_all().await.unwrap().is_empty());
    assert_eq!(store.discard_dead_letters().await.unwrap(), 2);
    assert!(store.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn network_failure_keeps_entry_queued() {
    let store = DataStoreCollaborator::open_in_memory().unwrap();
    let remote = MemoryCollaborator::new();
    remote.fail(Op::Create, CollaboratorError::Network("offline".into()));

    store.create("Offline", None).await.unwrap();
    let report = store.sync(&remote).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(!report.is_clean());
    assert_eq!(store.pending_mutations().await.unwrap(), 1);
    assert!(store.dead_letters().await.unwrap().is_empty());

    // Backoff keeps the entry out of an immediate second pass
    remote.clear_failures();
    let report = store.sync(&remote).await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(remote.call_count(Op::Create), 1);
}
