use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Collaborator, CollaboratorError, CollaboratorKind};
use crate::model::{Item, ItemId, Version};
use crate::outbox::{MutationIntent, OpId, OutboxEntry, OutboxEntryError, OutboxError};
use crate::{UnixTimeMs, SYNC_BATCH_LIMIT};

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;

    CREATE TABLE IF NOT EXISTS todos (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        version INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        remote_id TEXT,
        remote_version INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        op_id TEXT NOT NULL UNIQUE,
        todo_id TEXT NOT NULL,
        retry_state TEXT NOT NULL,
        entry TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_todos_remote ON todos(remote_id);
    CREATE INDEX IF NOT EXISTS idx_outbox_todo ON outbox(todo_id);
";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl From<SyncError> for CollaboratorError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Collaborator(inner) => inner,
            other => CollaboratorError::Storage(other.to_string()),
        }
    }
}

/// Outcome of one [`DataStoreCollaborator::sync`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl SyncReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.dead_lettered == 0
    }
}

struct RemoteLink {
    remote_id: Option<ItemId>,
    remote_version: Option<Version>,
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: Some(ItemId::new(row.get::<_, String>(0)?)),
        name: row.get(1)?,
        description: row.get(2)?,
        version: Some(Version(from_sql_int(row.get(3)?))),
    })
}

/// Offline-first todo store: SQLite locally, an outbox of pending mutations,
/// and an explicit [`sync`](Self::sync) that pushes them to a remote.
///
/// Every local write and its outbox entry commit in one transaction. Ids are
/// local; the remote's ids and versions are recorded per row once pushed.
/// SQL runs on the blocking pool. `sync` and `pull` never overlap.
pub struct DataStoreCollaborator {
    conn: Arc<Mutex<Connection>>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl DataStoreCollaborator {
    /// Open (or create) a database at the given path.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        Self::init_with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        Self::init_with_connection(Connection::open_in_memory()?)
    }

    fn init_with_connection(conn: Connection) -> Result<Self, SyncError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sync_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SyncError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }

    fn enqueue(tx: &Transaction<'_>, entry: &OutboxEntry) -> Result<(), SyncError> {
        let data = serde_json::to_string(entry).map_err(|e| OutboxError::Storage(e.to_string()))?;
        tx.execute(
            "INSERT INTO outbox (op_id, todo_id, retry_state, entry) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.op_id.as_str(),
                entry.todo_id,
                entry.retry_state.as_str(),
                data
            ],
        )?;
        Ok(())
    }

    async fn save_entry(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        let data = serde_json::to_string(entry).map_err(|e| OutboxError::Storage(e.to_string()))?;
        let op_id = entry.op_id.clone();
        let retry_state = entry.retry_state;
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE outbox SET retry_state = ?1, entry = ?2 WHERE op_id = ?3",
                params![retry_state.as_str(), data, op_id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Reads outbox entries in push order.
    fn load_outbox(conn: &Connection, filter: &str) -> Result<Vec<OutboxEntry>, SyncError> {
        let sql = format!("SELECT op_id, entry FROM outbox {filter} ORDER BY seq ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(op_id, data)| {
                serde_json::from_str(&data).map_err(|e| {
                    SyncError::Outbox(OutboxError::CorruptedEntry {
                        op_id,
                        reason: e.to_string(),
                    })
                })
            })
            .collect()
    }

    /// Loads the live row and checks the caller's version token.
    fn current_version(
        tx: &Transaction<'_>,
        id: &ItemId,
        expected: Option<Version>,
    ) -> Result<Version, SyncError> {
        let stored: Option<i64> = tx
            .query_row(
                "SELECT version FROM todos WHERE id = ?1 AND deleted = 0",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored
            .map(|v| Version(from_sql_int(v)))
            .ok_or_else(|| CollaboratorError::NotFound(id.clone()))?;

        match expected {
            Some(version) if version != stored => Err(CollaboratorError::Conflict {
                id: id.clone(),
                version: Some(version),
            }
            .into()),
            _ => Ok(stored),
        }
    }

    async fn insert(&self, name: &str, description: Option<&str>) -> Result<Item, SyncError> {
        let item = Item {
            id: Some(ItemId::new(Uuid::new_v4().to_string())),
            name: name.to_string(),
            description: description.map(str::to_string),
            version: Some(Version::INITIAL),
        };
        let id = item.id.as_ref().map(ItemId::to_string).unwrap_or_default();
        let entry = OutboxEntry::new(
            id.as_str(),
            MutationIntent::Create {
                name: item.name.clone(),
                description: item.description.clone(),
            },
        );
        let op_id = entry.op_id.clone();

        let row = item.clone();
        self.blocking(move |conn| {
            let now = to_sql_int(UnixTimeMs::now().0);
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO todos (id, name, description, version, deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                params![id, row.name, row.description, to_sql_int(Version::INITIAL.0), now],
            )?;
            Self::enqueue(&tx, &entry)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(todo_id = ?item.id, %op_id, "todo created locally");
        Ok(item)
    }

    async fn modify(
        &self,
        id: &ItemId,
        expected: Option<Version>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Item, SyncError> {
        let entry = OutboxEntry::new(
            id.as_str(),
            MutationIntent::Update {
                name: name.to_string(),
                description: description.map(str::to_string),
            },
        );
        let mut item = Item {
            id: Some(id.clone()),
            name: name.to_string(),
            description: description.map(str::to_string),
            version: None,
        };

        let id = id.clone();
        let (name, description) = (item.name.clone(), item.description.clone());
        let next = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let next = Self::current_version(&tx, &id, expected)?.next();
                tx.execute(
                    "UPDATE todos SET name = ?1, description = ?2, version = ?3, updated_at = ?4 WHERE id = ?5",
                    params![
                        name,
                        description,
                        to_sql_int(next.0),
                        to_sql_int(UnixTimeMs::now().0),
                        id.as_str()
                    ],
                )?;
                Self::enqueue(&tx, &entry)?;
                tx.commit()?;
                Ok(next)
            })
            .await?;

        item.version = Some(next);
        Ok(item)
    }

    async fn soft_delete(&self, id: &ItemId, expected: Option<Version>) -> Result<(), SyncError> {
        let entry = OutboxEntry::new(id.as_str(), MutationIntent::Delete);
        let id = id.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let next = Self::current_version(&tx, &id, expected)?.next();
            tx.execute(
                "UPDATE todos SET deleted = 1, version = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_sql_int(next.0), to_sql_int(UnixTimeMs::now().0), id.as_str()],
            )?;
            Self::enqueue(&tx, &entry)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remote_link(&self, todo_id: &str) -> Result<RemoteLink, SyncError> {
        let todo_id = todo_id.to_string();
        self.blocking(move |conn| {
            let link = conn
                .query_row(
                    "SELECT remote_id, remote_version FROM todos WHERE id = ?1",
                    params![todo_id],
                    |row| {
                        Ok(RemoteLink {
                            remote_id: row.get::<_, Option<String>>(0)?.map(ItemId::new),
                            remote_version: row.get::<_, Option<i64>>(1)?.map(|v| Version(from_sql_int(v))),
                        })
                    },
                )
                .optional()?;
            Ok(link.unwrap_or(RemoteLink {
                remote_id: None,
                remote_version: None,
            }))
        })
        .await
    }

    /// Applies one outbox entry to the remote. `Ok(None)` means nothing to record.
    async fn push(
        &self,
        remote: &dyn Collaborator,
        entry: &OutboxEntry,
    ) -> Result<Option<Item>, CollaboratorError> {
        let link = self
            .remote_link(&entry.todo_id)
            .await
            .map_err(CollaboratorError::from)?;
        let unlinked = || CollaboratorError::NotFound(ItemId::new(entry.todo_id.as_str()));

        match &entry.intent {
            MutationIntent::Create { name, description } => {
                remote.create(name, description.as_deref()).await.map(Some)
            }
            MutationIntent::Update { name, description } => {
                let remote_id = link.remote_id.ok_or_else(unlinked)?;
                remote
                    .update(&remote_id, link.remote_version, name, description.as_deref())
                    .await
                    .map(Some)
            }
            MutationIntent::Delete => {
                let Some(remote_id) = link.remote_id else {
                    return Ok(None);
                };
                match remote.delete(&remote_id, link.remote_version).await {
                    Ok(()) | Err(CollaboratorError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn complete(&self, entry: &OutboxEntry, remote_item: Option<Item>) -> Result<(), SyncError> {
        let op_id = entry.op_id.clone();
        let todo_id = entry.todo_id.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            if let Some(item) = remote_item {
                tx.execute(
                    "UPDATE todos SET remote_id = COALESCE(?1, remote_id), remote_version = ?2 WHERE id = ?3",
                    params![
                        item.id.as_ref().map(ItemId::as_str),
                        item.version.map(|v| to_sql_int(v.0)),
                        todo_id
                    ],
                )?;
            }
            tx.execute("DELETE FROM outbox WHERE op_id = ?1", params![op_id.as_str()])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Pushes due outbox entries to `remote`, oldest first.
    ///
    /// Entries for one todo are strictly ordered: a failure stops the rest of
    /// that todo's entries for this pass, and a permanent failure dead-letters
    /// them. Entries for other todos continue.
    #[instrument(skip(self, remote), fields(remote = remote.kind().as_str()))]
    pub async fn sync(&self, remote: &dyn Collaborator) -> Result<SyncReport, SyncError> {
        let _guard = self.sync_lock.lock().await;
        let entries = self
            .blocking(|conn| {
                let mut entries = Self::load_outbox(conn, "")?;
                entries.truncate(SYNC_BATCH_LIMIT);
                Ok(entries)
            })
            .await?;

        let now = UnixTimeMs::now();
        let mut report = SyncReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut dead: HashMap<String, OpId> = HashMap::new();

        for mut entry in entries {
            if let Some(cause) = dead.get(&entry.todo_id) {
                if !entry.is_permanently_failed() {
                    entry.mark_blocked_by(cause);
                    self.save_entry(&entry).await?;
                    report.dead_lettered += 1;
                }
                continue;
            }
            if entry.is_permanently_failed() {
                dead.insert(entry.todo_id.clone(), entry.op_id.clone());
                continue;
            }
            if blocked.contains(&entry.todo_id) || !entry.is_ready_for_retry(now) {
                blocked.insert(entry.todo_id.clone());
                continue;
            }

            match self.push(remote, &entry).await {
                Ok(remote_item) => {
                    self.complete(&entry, remote_item).await?;
                    report.pushed += 1;
                    debug!(op_id = %entry.op_id, intent = entry.intent.intent_type(), "outbox entry pushed");
                }
                Err(e) => {
                    entry.mark_failed(OutboxEntryError::from(&e));
                    self.save_entry(&entry).await?;
                    if entry.is_permanently_failed() {
                        warn!(op_id = %entry.op_id, error = %e, code = e.kind().code(), "outbox entry dead-lettered");
                        dead.insert(entry.todo_id.clone(), entry.op_id.clone());
                        report.dead_lettered += 1;
                    } else {
                        warn!(op_id = %entry.op_id, error = %e, attempt = entry.attempt_count, "outbox push failed, will retry");
                        blocked.insert(entry.todo_id.clone());
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            pushed = report.pushed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "sync finished"
        );
        Ok(report)
    }

    /// Merges the remote list into rows that have no outstanding outbox entries.
    ///
    /// Holds the sync lock from the remote fetch to the commit, so a row
    /// linked by a concurrent push is never judged against an older snapshot.
    /// Returns the number of rows inserted, changed or removed.
    #[instrument(skip(self, remote), fields(remote = remote.kind().as_str()))]
    pub async fn pull(&self, remote: &dyn Collaborator) -> Result<usize, SyncError> {
        let _guard = self.sync_lock.lock().await;
        let remote_items = remote.fetch_all().await?;
        let remote_total = remote_items.len();
        let changed = self
            .blocking(move |conn| Self::merge_remote(conn, &remote_items))
            .await?;
        info!(changed, remote_total, "pull finished");
        Ok(changed)
    }

    fn merge_remote(conn: &mut Connection, remote_items: &[Item]) -> Result<usize, SyncError> {
        let tx = conn.transaction()?;
        let pending: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT DISTINCT todo_id FROM outbox")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<_, _>>()?;
            ids
        };
        let linked: HashMap<String, (String, Item, bool)> = {
            let mut stmt = tx.prepare(
                "SELECT id, name, description, version, remote_id, remote_version, deleted
                 FROM todos WHERE remote_id IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let local_id: String = row.get(0)?;
                    let remote_id: String = row.get(4)?;
                    let snapshot = Item {
                        id: Some(ItemId::new(remote_id.as_str())),
                        name: row.get(1)?,
                        description: row.get(2)?,
                        version: row.get::<_, Option<i64>>(5)?.map(|v| Version(from_sql_int(v))),
                    };
                    Ok((remote_id, (local_id, snapshot, row.get::<_, bool>(6)?)))
                })?
                .collect::<Result<_, _>>()?;
            rows
        };

        let now = to_sql_int(UnixTimeMs::now().0);
        let mut changed = 0;
        let mut seen: HashSet<&str> = HashSet::new();

        for item in remote_items {
            let Some(remote_id) = item.id.as_ref() else {
                continue;
            };
            seen.insert(remote_id.as_str());
            match linked.get(remote_id.as_str()) {
                Some((local_id, _, _)) if pending.contains(local_id) => {}
                Some((_, snapshot, deleted)) if snapshot == item && !deleted => {}
                Some((local_id, _, _)) => {
                    tx.execute(
                        "UPDATE todos SET name = ?1, description = ?2, remote_version = ?3,
                         deleted = 0, version = version + 1, updated_at = ?4 WHERE id = ?5",
                        params![
                            item.name,
                            item.description,
                            item.version.map(|v| to_sql_int(v.0)),
                            now,
                            local_id
                        ],
                    )?;
                    changed += 1;
                }
                None => {
                    tx.execute(
                        "INSERT INTO todos (id, name, description, version, deleted, remote_id,
                         remote_version, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7)",
                        params![
                            Uuid::new_v4().to_string(),
                            item.name,
                            item.description,
                            to_sql_int(Version::INITIAL.0),
                            remote_id.as_str(),
                            item.version.map(|v| to_sql_int(v.0)),
                            now
                        ],
                    )?;
                    changed += 1;
                }
            }
        }

        for (remote_id, (local_id, _, deleted)) in &linked {
            if *deleted || seen.contains(remote_id.as_str()) || pending.contains(local_id) {
                continue;
            }
            tx.execute(
                "UPDATE todos SET deleted = 1, version = version + 1, updated_at = ?1 WHERE id = ?2",
                params![now, local_id],
            )?;
            changed += 1;
        }

        tx.commit()?;
        Ok(changed)
    }

    /// Outbox entries still waiting to be pushed (dead letters excluded).
    pub async fn pending_mutations(&self) -> Result<usize, SyncError> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE retry_state != 'permanently_failed'",
                [],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    /// Entries that will not be retried, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<OutboxEntry>, SyncError> {
        self.blocking(|conn| Self::load_outbox(conn, "WHERE retry_state = 'permanently_failed'"))
            .await
    }

    /// Drops dead-lettered entries after they have been inspected.
    pub async fn discard_dead_letters(&self) -> Result<usize, SyncError> {
        self.blocking(|conn| {
            let removed = conn.execute("DELETE FROM outbox WHERE retry_state = 'permanently_failed'", [])?;
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl Collaborator for DataStoreCollaborator {
    fn kind(&self) -> CollaboratorKind {
        CollaboratorKind::DataStore
    }

    async fn fetch_all(&self) -> Result<Vec<Item>, CollaboratorError> {
        let items = self
            .blocking(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, version FROM todos
                     WHERE deleted = 0 ORDER BY created_at ASC, rowid ASC",
                )?;
                let items = stmt
                    .query_map([], item_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(items)
            })
            .await?;
        Ok(items)
    }

    async fn fetch_by_id(&self, id: &ItemId) -> Result<Option<Item>, CollaboratorError> {
        let id = id.clone();
        let item = self
            .blocking(move |conn| {
                let item = conn
                    .query_row(
                        "SELECT id, name, description, version FROM todos WHERE id = ?1 AND deleted = 0",
                        params![id.as_str()],
                        item_from_row,
                    )
                    .optional()?;
                Ok(item)
            })
            .await?;
        Ok(item)
    }

    #[instrument(skip(self, description))]
    async fn create(&self, name: &str, description: Option<&str>) -> Result<Item, CollaboratorError> {
        Ok(self.insert(name, description).await?)
    }

    #[instrument(skip(self, name, description))]
    async fn update(
        &self,
        id: &ItemId,
        version: Option<Version>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Item, CollaboratorError> {
        Ok(self.modify(id, version, name, description).await?)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &ItemId, version: Option<Version>) -> Result<(), CollaboratorError> {
        Ok(self.soft_delete(id, version).await?)
    }
}
