use std::sync::Arc;

use todo_core::capabilities::{MemoryCollaborator, Op};
use todo_core::{
    CollaboratorError, Draft, EditMode, Editor, EditorConfig, ErrorKind, Event, FailurePolicy,
    NoticeKind, SyncState,
};

async fn wait_for_call(backend: &MemoryCollaborator, op: Op, count: usize) {
    for _ in 0..1000 {
        if backend.call_count(op) >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {count} {op:?} calls");
}

#[tokio::test]
async fn slow_network_create_then_edit_flow() {
    let backend = Arc::new(MemoryCollaborator::new());
    backend.seed("Existing", Some("already there"));
    let editor = Arc::new(Editor::new(backend.clone(), EditorConfig::default()));

    // 1. Mount
    editor.dispatch(Event::Mounted).await;
    assert_eq!(editor.view().await.items.len(), 1);

    // 2. Two creates while the network is slow
    backend.hold_creates();
    editor.dispatch(Event::NameChanged("Buy milk".into())).await;
    let first = tokio::spawn({
        let editor = editor.clone();
        async move { editor.dispatch(Event::Submit).await }
    });
    wait_for_call(&backend, Op::Create, 1).await;

    // The form is cleared as soon as the entry is appended
    let view = editor.view().await;
    assert_eq!(view.pending_input, Draft::default());
    assert_eq!(view.items.len(), 2);
    assert_eq!(view.items[1].sync, SyncState::Pending);

    let second = tokio::spawn({
        let editor = editor.clone();
        async move { editor.create("Walk dog", "around the block").await }
    });
    wait_for_call(&backend, Op::Create, 2).await;
    assert_eq!(editor.view().await.pending_count, 2);

    // 3. Network catches up
    backend.release_create();
    backend.release_create();
    first.await.unwrap();
    second.await.unwrap();

    let view = editor.view().await;
    assert_eq!(view.pending_count, 0);
    let names: Vec<_> = view.items.iter().map(|e| e.item.name.as_str()).collect();
    assert_eq!(names, vec!["Existing", "Buy milk", "Walk dog"]);
    assert!(view.items.iter().all(|e| e.item.id.is_some()));

    // 4. Edit the second todo
    let id = view.items[2].item.id.clone().unwrap();
    editor.begin_edit(&id).await;
    editor
        .set_edit_buffer(Draft::new("Walk dog", "to the park"))
        .await;
    editor.commit_edit().await;

    let view = editor.view().await;
    assert_eq!(view.edit, EditMode::Idle);
    assert_eq!(view.items[2].item.description.as_deref(), Some("to the park"));
    assert_eq!(view.notice.unwrap().kind, NoticeKind::Success);
}

#[tokio::test]
async fn stale_delete_from_second_client_conflicts_then_refresh_recovers() {
    let backend = Arc::new(MemoryCollaborator::new());
    let seeded = backend.seed("Shared", None);
    let id = seeded.id.clone().unwrap();

    let alice = Editor::new(backend.clone(), EditorConfig::default());
    let bob = Editor::new(
        backend.clone(),
        EditorConfig {
            failure_policy: FailurePolicy::Rollback,
            ..EditorConfig::default()
        },
    );
    alice.load().await;
    bob.load().await;

    // Alice renames while Bob still holds version 1
    alice.begin_edit(&id).await;
    alice.set_edit_buffer(Draft::new("Shared (renamed)", "")).await;
    alice.commit_edit().await;
    assert_eq!(alice.view().await.items[0].item.name, "Shared (renamed)");

    // Bob's delete carries the stale token
    bob.delete(&id).await;
    let view = bob.view().await;
    assert_eq!(view.items.len(), 1, "rollback restores the entry");
    let notice = view.notice.unwrap();
    assert_eq!(notice.kind, NoticeKind::Error);
    assert_eq!(notice.message, ErrorKind::Conflict.user_facing_message());

    // Refresh picks up the authoritative state and the retry goes through
    bob.refresh().await;
    assert_eq!(bob.view().await.items[0].item.name, "Shared (renamed)");
    bob.delete(&id).await;
    assert!(bob.view().await.items.is_empty());
    assert!(backend.stored().is_empty());
}

#[tokio::test]
async fn unversioned_backend_accepts_last_write() {
    let backend = Arc::new(MemoryCollaborator::without_versions());
    let seeded = backend.seed("Plain", None);
    let id = seeded.id.unwrap();
    let editor = Editor::new(backend.clone(), EditorConfig::default());
    editor.load().await;

    backend.modify_remote(&id, "Plain (changed)", None);
    editor.delete(&id).await;

    assert!(editor.view().await.items.is_empty());
    assert_eq!(editor.view().await.notice.unwrap().kind, NoticeKind::Success);
    assert!(backend.stored().is_empty());
}

#[tokio::test]
async fn failures_leave_consistent_list_until_refresh() {
    let backend = Arc::new(MemoryCollaborator::new());
    backend.seed("A", None);
    let editor = Editor::new(backend.clone(), EditorConfig::default());
    editor.load().await;

    // 1. Backend goes down
    backend.fail(Op::Create, CollaboratorError::Network("offline".into()));
    backend.fail(Op::Delete, CollaboratorError::Timeout { timeout_ms: 30_000 });

    editor.create("B", "").await;
    let a = editor.view().await.items[0].item.id.clone().unwrap();
    editor.delete(&a).await;

    let view = editor.view().await;
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].item.name, "B");
    assert_eq!(view.failed_count, 1);
    assert_eq!(view.notice.unwrap().message, "Error deleting todo");

    // 2. Backend recovers; refresh shows the authoritative list
    backend.clear_failures();
    editor.dispatch(Event::RefreshRequested).await;

    let view = editor.view().await;
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].item.name, "A");
    assert_eq!(view.failed_count, 0);
}

#[tokio::test]
async fn unmount_detaches_in_flight_work() {
    let backend = Arc::new(MemoryCollaborator::new());
    backend.hold_creates();
    let editor = Arc::new(Editor::new(backend.clone(), EditorConfig::default()));
    editor.load().await;

    let task = tokio::spawn({
        let editor = editor.clone();
        async move { editor.create("Never confirmed", "").await }
    });
    wait_for_call(&backend, Op::Create, 1).await;

    editor.unmount().await;
    backend.release_create();
    task.await.unwrap();

    let view = editor.view().await;
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].sync, SyncState::Pending);
    assert!(view.notice.is_none());
}
