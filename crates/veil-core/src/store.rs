//! Conversation persistence: whole-record saves keyed by conversation id.
//!
//! Saving replaces the stored record; with concurrent saves of one id the last writer wins.
//! Listing is most recent first by the record's `date`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::schema::{ChatTurn, Conversation};

pub trait ConversationStore: Send + Sync {
    fn save(&self, conversation: &Conversation) -> StoreResult<()>;
    fn get(&self, id: Uuid) -> StoreResult<Option<Conversation>>;
    /// Most recent first; `limit` of `None` returns everything.
    fn list_recent(&self, limit: Option<usize>) -> StoreResult<Vec<Conversation>>;
    /// Returns true when a record was removed.
    fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

/// SQLite-backed store. A connection is held behind a mutex and reused.
pub struct SqliteConversationStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteConversationStore {
    pub fn open(db_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::init(&conn)?;
        tracing::info!(
            target: "veil::store",
            path = %db_path.display(),
            "Conversation store opened"
        );
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                date_ms INTEGER NOT NULL,
                turns_json TEXT NOT NULL,
                turn_ids_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_date ON conversations(date_ms);
            "#,
        )
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Task("connection mutex poisoned".to_string()))?;
        f(&conn)
    }
}

type RawRow = (String, String, String, String);

fn decode_row((id, date, turns_json, turn_ids_json): RawRow) -> StoreResult<Conversation> {
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };
    let uuid = Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?;
    let date = DateTime::parse_from_rfc3339(&date)
        .map_err(|e| corrupt(e.to_string()))?
        .with_timezone(&Utc);
    let turns: Vec<ChatTurn> = serde_json::from_str(&turns_json)?;
    let turn_ids: Vec<Uuid> = serde_json::from_str(&turn_ids_json)?;
    let conversation = Conversation::from_parts(uuid, date, turns, turn_ids);
    conversation.check_consistency().map_err(corrupt)?;
    Ok(conversation)
}

impl ConversationStore for SqliteConversationStore {
    fn save(&self, conversation: &Conversation) -> StoreResult<()> {
        let turns_json = serde_json::to_string(conversation.turns())?;
        let turn_ids_json = serde_json::to_string(conversation.turn_ids())?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, date, date_ms, turns_json, turn_ids_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    date = excluded.date,
                    date_ms = excluded.date_ms,
                    turns_json = excluded.turns_json,
                    turn_ids_json = excluded.turn_ids_json",
                params![
                    conversation.id.to_string(),
                    conversation.date.to_rfc3339(),
                    conversation.date.timestamp_millis(),
                    turns_json,
                    turn_ids_json
                ],
            )?;
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let row: Option<RawRow> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, date, turns_json, turn_ids_json FROM conversations WHERE id = ?1",
                    params![id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .optional()?)
        })?;
        row.map(decode_row).transpose()
    }

    fn list_recent(&self, limit: Option<usize>) -> StoreResult<Vec<Conversation>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows: Vec<RawRow> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, turns_json, turn_ids_json FROM conversations
                 ORDER BY date_ms DESC, id ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(decode_row).collect()
    }

    fn delete(&self, id: Uuid) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(n > 0)
        })
    }
}

/// In-process store for tests and offline runs.
#[derive(Default)]
pub struct MemoryConversationStore {
    records: DashMap<Uuid, Conversation>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn save(&self, conversation: &Conversation) -> StoreResult<()> {
        self.records.insert(conversation.id, conversation.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    fn list_recent(&self, limit: Option<usize>) -> StoreResult<Vec<Conversation>> {
        let mut all: Vec<Conversation> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    fn delete(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.records.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(turns: usize, minutes_ago: i64) -> Conversation {
        let mut convo = Conversation::new(Uuid::new_v4());
        for i in 0..turns {
            if i % 2 == 0 {
                convo.push_turn(ChatTurn::question(Uuid::new_v4(), "My name is John Doe"));
            } else {
                convo.push_turn(ChatTurn::answer(
                    Uuid::new_v4(),
                    "Hello $1, born $2",
                    vec!["John Doe".into(), "02/02/1994".into()],
                ));
            }
        }
        convo.date = Utc::now() - Duration::minutes(minutes_ago);
        convo
    }

    fn exercise(store: &dyn ConversationStore) {
        let older = sample(2, 10);
        let newer = sample(4, 1);
        store.save(&older).unwrap();
        store.save(&newer).unwrap();

        let listed = store.list_recent(None).unwrap();
        assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![newer.id, older.id]);
        assert_eq!(store.list_recent(Some(1)).unwrap().len(), 1);

        let loaded = store.get(older.id).unwrap().unwrap();
        assert_eq!(loaded.turns(), older.turns());
        assert_eq!(loaded.turn_ids(), older.turn_ids());

        // Whole-record replace.
        let mut replaced = older.clone();
        replaced.replace_turns(vec![ChatTurn::question(Uuid::new_v4(), "only one")]);
        replaced.touch();
        store.save(&replaced).unwrap();
        let loaded = store.get(older.id).unwrap().unwrap();
        assert_eq!(loaded.turns().len(), 1);
        assert_eq!(store.list_recent(None).unwrap()[0].id, older.id);

        assert!(store.delete(older.id).unwrap());
        assert!(!store.delete(older.id).unwrap());
        assert!(store.get(older.id).unwrap().is_none());
    }

    #[test]
    fn memory_store_semantics() {
        exercise(&MemoryConversationStore::new());
    }

    #[test]
    fn sqlite_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open(dir.path().join("nested/veil.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.db");
        let convo = sample(2, 0);
        SqliteConversationStore::open(&path).unwrap().save(&convo).unwrap();

        let reopened = SqliteConversationStore::open(&path).unwrap();
        let loaded = reopened.get(convo.id).unwrap().unwrap();
        assert_eq!(loaded.turns()[1].pii_values(), &["John Doe", "02/02/1994"]);
    }

    #[test]
    fn corrupt_turn_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open(dir.path().join("veil.db")).unwrap();
        let convo = sample(2, 0);
        store.save(&convo).unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE conversations SET turn_ids_json = '[]' WHERE id = ?1",
                    params![convo.id.to_string()],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(store.get(convo.id), Err(StoreError::Corrupt { .. })));
    }
}
