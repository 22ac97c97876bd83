//! SQLite-backed durable state for the agent hub: clients, threads, turns and
//! the append-only per-turn event log.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

mod migrations;

use migrations::MIGRATIONS;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage: not found")]
    NotFound,
    #[error("storage: {0}")]
    InvalidInput(String),
    #[error("storage: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage: parse timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// One persisted thread row.
#[derive(Debug, Clone)]
pub struct Thread {
    pub thread_id: String,
    pub client_id: String,
    pub agent_id: String,
    pub cwd: String,
    pub title: String,
    pub agent_options_json: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateThreadParams {
    pub thread_id: String,
    pub client_id: String,
    pub agent_id: String,
    pub cwd: String,
    pub title: String,
    pub agent_options_json: String,
    pub summary: String,
}

/// One persisted turn row.
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn_id: String,
    pub thread_id: String,
    pub request_text: String,
    pub response_text: String,
    pub is_internal: bool,
    pub status: String,
    pub stop_reason: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTurnParams {
    pub turn_id: String,
    pub thread_id: String,
    pub request_text: String,
    pub status: String,
    pub is_internal: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FinalizeTurnParams {
    pub turn_id: String,
    pub response_text: String,
    pub status: String,
    pub stop_reason: String,
    pub error_message: String,
}

/// One persisted turn event row. `seq` is 1-based and contiguous per turn.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: i64,
    pub turn_id: String,
    pub seq: i64,
    pub event_type: String,
    pub data_json: String,
    pub created_at: DateTime<Utc>,
}

/// Repository over a single-connection SQLite pool. The one-connection cap
/// serializes writers at the SQL layer; callers may still invoke
/// concurrently from any task.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the database file, configures pragmas and applies migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Opens a private in-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        // The in-memory database lives and dies with its one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        for migration in MIGRATIONS {
            let applied: Option<i64> =
                sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = ?;")
                    .bind(migration.version)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?);")
                .bind(migration.version)
                .bind(migration.name)
                .bind(format_time(Utc::now()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::debug!(version = migration.version, name = migration.name, "applied migration");
        }

        Ok(())
    }

    /// Idempotent client heartbeat.
    pub async fn upsert_client(&self, client_id: &str) -> Result<(), StorageError> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(StorageError::InvalidInput("client_id is required".into()));
        }

        let now = format_time(Utc::now());
        sqlx::query(
            "INSERT INTO clients (client_id, created_at, last_seen_at)
             VALUES (?, ?, ?)
             ON CONFLICT(client_id) DO UPDATE SET last_seen_at = excluded.last_seen_at;",
        )
        .bind(client_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_thread(&self, params: CreateThreadParams) -> Result<Thread, StorageError> {
        if params.thread_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("thread_id is required".into()));
        }
        if params.client_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("client_id is required".into()));
        }
        if params.agent_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("agent_id is required".into()));
        }
        if params.cwd.trim().is_empty() {
            return Err(StorageError::InvalidInput("cwd is required".into()));
        }

        let agent_options_json = if params.agent_options_json.trim().is_empty() {
            "{}".to_string()
        } else {
            params.agent_options_json
        };

        let now = Utc::now();
        let now_text = format_time(now);
        sqlx::query(
            "INSERT INTO threads (
                thread_id, client_id, agent_id, cwd, title,
                agent_options_json, summary, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(&params.thread_id)
        .bind(&params.client_id)
        .bind(&params.agent_id)
        .bind(&params.cwd)
        .bind(&params.title)
        .bind(&agent_options_json)
        .bind(&params.summary)
        .bind(&now_text)
        .bind(&now_text)
        .execute(&self.pool)
        .await?;

        Ok(Thread {
            thread_id: params.thread_id,
            client_id: params.client_id,
            agent_id: params.agent_id,
            cwd: params.cwd,
            title: params.title,
            agent_options_json,
            summary: params.summary,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Thread, StorageError> {
        let row = sqlx::query(
            "SELECT thread_id, client_id, agent_id, cwd, title,
                    agent_options_json, summary, created_at, updated_at
             FROM threads
             WHERE thread_id = ?;",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound)?;

        thread_from_row(&row)
    }

    pub async fn list_threads_by_client(&self, client_id: &str) -> Result<Vec<Thread>, StorageError> {
        let rows = sqlx::query(
            "SELECT thread_id, client_id, agent_id, cwd, title,
                    agent_options_json, summary, created_at, updated_at
             FROM threads
             WHERE client_id = ?
             ORDER BY created_at DESC;",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(thread_from_row).collect()
    }

    /// Overwrites the rolling summary and bumps `updated_at`.
    pub async fn update_thread_summary(
        &self,
        thread_id: &str,
        summary: &str,
    ) -> Result<(), StorageError> {
        if thread_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("thread_id is required".into()));
        }

        let result = sqlx::query(
            "UPDATE threads SET summary = ?, updated_at = ? WHERE thread_id = ?;",
        )
        .bind(summary)
        .bind(format_time(Utc::now()))
        .bind(thread_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub async fn create_turn(&self, params: CreateTurnParams) -> Result<Turn, StorageError> {
        if params.turn_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("turn_id is required".into()));
        }
        if params.thread_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("thread_id is required".into()));
        }

        let status = if params.status.trim().is_empty() {
            "running".to_string()
        } else {
            params.status
        };

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO turns (
                turn_id, thread_id, request_text, response_text, is_internal,
                status, stop_reason, error_message, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL);",
        )
        .bind(&params.turn_id)
        .bind(&params.thread_id)
        .bind(&params.request_text)
        .bind("")
        .bind(i64::from(params.is_internal))
        .bind(&status)
        .bind("")
        .bind("")
        .bind(format_time(now))
        .execute(&self.pool)
        .await?;

        Ok(Turn {
            turn_id: params.turn_id,
            thread_id: params.thread_id,
            request_text: params.request_text,
            response_text: String::new(),
            is_internal: params.is_internal,
            status,
            stop_reason: String::new(),
            error_message: String::new(),
            created_at: now,
            completed_at: None,
        })
    }

    pub async fn get_turn(&self, turn_id: &str) -> Result<Turn, StorageError> {
        let row = sqlx::query(
            "SELECT turn_id, thread_id, request_text, response_text, is_internal,
                    status, stop_reason, error_message, created_at, completed_at
             FROM turns
             WHERE turn_id = ?;",
        )
        .bind(turn_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound)?;

        turn_from_row(&row)
    }

    pub async fn list_turns_by_thread(&self, thread_id: &str) -> Result<Vec<Turn>, StorageError> {
        let rows = sqlx::query(
            "SELECT turn_id, thread_id, request_text, response_text, is_internal,
                    status, stop_reason, error_message, created_at, completed_at
             FROM turns
             WHERE thread_id = ?
             ORDER BY created_at ASC;",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(turn_from_row).collect()
    }

    /// Appends one event with the next contiguous per-turn sequence number.
    /// The `(turn_id, seq)` unique index doubles as an integrity check.
    pub async fn append_event(
        &self,
        turn_id: &str,
        event_type: &str,
        data_json: &str,
    ) -> Result<Event, StorageError> {
        if turn_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("turn_id is required".into()));
        }
        if event_type.trim().is_empty() {
            return Err(StorageError::InvalidInput("event type is required".into()));
        }
        let data_json = if data_json.trim().is_empty() {
            "{}"
        } else {
            data_json
        };

        let mut tx = self.pool.begin().await?;

        let max_seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM events WHERE turn_id = ?;")
                .bind(turn_id)
                .fetch_one(&mut *tx)
                .await?;
        let seq = max_seq + 1;

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO events (turn_id, seq, type, data_json, created_at)
             VALUES (?, ?, ?, ?, ?);",
        )
        .bind(turn_id)
        .bind(seq)
        .bind(event_type)
        .bind(data_json)
        .bind(format_time(now))
        .execute(&mut *tx)
        .await?;
        let event_id = result.last_insert_rowid();

        tx.commit().await?;

        Ok(Event {
            event_id,
            turn_id: turn_id.to_string(),
            seq,
            event_type: event_type.to_string(),
            data_json: data_json.to_string(),
            created_at: now,
        })
    }

    pub async fn list_events_by_turn(&self, turn_id: &str) -> Result<Vec<Event>, StorageError> {
        let rows = sqlx::query(
            "SELECT event_id, turn_id, seq, type, data_json, created_at
             FROM events
             WHERE turn_id = ?
             ORDER BY seq ASC;",
        )
        .bind(turn_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Event {
                    event_id: row.get("event_id"),
                    turn_id: row.get("turn_id"),
                    seq: row.get("seq"),
                    event_type: row.get("type"),
                    data_json: row.get("data_json"),
                    created_at: parse_time(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }

    /// Writes the terminal fields for a turn and stamps `completed_at`.
    pub async fn finalize_turn(&self, params: FinalizeTurnParams) -> Result<(), StorageError> {
        if params.turn_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("turn_id is required".into()));
        }
        if params.status.trim().is_empty() {
            return Err(StorageError::InvalidInput("status is required".into()));
        }

        let result = sqlx::query(
            "UPDATE turns
             SET response_text = ?, status = ?, stop_reason = ?, error_message = ?, completed_at = ?
             WHERE turn_id = ?;",
        )
        .bind(&params.response_text)
        .bind(&params.status)
        .bind(&params.stop_reason)
        .bind(&params.error_message)
        .bind(format_time(Utc::now()))
        .bind(&params.turn_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

fn thread_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Thread, StorageError> {
    Ok(Thread {
        thread_id: row.get("thread_id"),
        client_id: row.get("client_id"),
        agent_id: row.get("agent_id"),
        cwd: row.get("cwd"),
        title: row.get("title"),
        agent_options_json: row.get("agent_options_json"),
        summary: row.get("summary"),
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
        updated_at: parse_time(&row.get::<String, _>("updated_at"))?,
    })
}

fn turn_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StorageError> {
    let completed_at = match row.get::<Option<String>, _>("completed_at") {
        Some(raw) => Some(parse_time(&raw)?),
        None => None,
    };
    Ok(Turn {
        turn_id: row.get("turn_id"),
        thread_id: row.get("thread_id"),
        request_text: row.get("request_text"),
        response_text: row.get("response_text"),
        is_internal: row.get::<i64, _>("is_internal") != 0,
        status: row.get("status"),
        stop_reason: row.get("stop_reason"),
        error_message: row.get("error_message"),
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
        completed_at,
    })
}

/// Timestamps are stored as RFC-3339 nanosecond-precision UTC strings so they
/// sort lexicographically.
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_thread() -> (Store, Thread) {
        let store = Store::open_in_memory().await.expect("open store");
        store.upsert_client("client-a").await.expect("upsert client");
        let thread = store
            .create_thread(CreateThreadParams {
                thread_id: "th_test".into(),
                client_id: "client-a".into(),
                agent_id: "fake".into(),
                cwd: "/tmp/proj".into(),
                ..Default::default()
            })
            .await
            .expect("create thread");
        (store, thread)
    }

    #[tokio::test]
    async fn thread_round_trip_defaults_agent_options() {
        let (store, thread) = store_with_thread().await;
        assert_eq!(thread.agent_options_json, "{}");

        let loaded = store.get_thread("th_test").await.expect("get thread");
        assert_eq!(loaded.client_id, "client-a");
        assert_eq!(loaded.agent_options_json, "{}");
        assert_eq!(loaded.summary, "");

        assert!(matches!(
            store.get_thread("th_missing").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn event_sequence_is_contiguous_per_turn() {
        let (store, thread) = store_with_thread().await;
        store
            .create_turn(CreateTurnParams {
                turn_id: "tu_1".into(),
                thread_id: thread.thread_id.clone(),
                request_text: "hello".into(),
                ..Default::default()
            })
            .await
            .expect("create turn");

        let first = store
            .append_event("tu_1", "turn_started", "")
            .await
            .expect("append first");
        let second = store
            .append_event("tu_1", "message_delta", r#"{"delta":"hi"}"#)
            .await
            .expect("append second");

        assert_eq!(first.seq, 1);
        assert_eq!(first.data_json, "{}");
        assert_eq!(second.seq, 2);

        let events = store.list_events_by_turn("tu_1").await.expect("list events");
        let seqs = events.iter().map(|event| event.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn finalize_turn_sets_terminal_fields() {
        let (store, thread) = store_with_thread().await;
        store
            .create_turn(CreateTurnParams {
                turn_id: "tu_done".into(),
                thread_id: thread.thread_id.clone(),
                request_text: "hello".into(),
                ..Default::default()
            })
            .await
            .expect("create turn");

        store
            .finalize_turn(FinalizeTurnParams {
                turn_id: "tu_done".into(),
                response_text: "world".into(),
                status: "completed".into(),
                stop_reason: "end_turn".into(),
                ..Default::default()
            })
            .await
            .expect("finalize");

        let turn = store.get_turn("tu_done").await.expect("get turn");
        assert_eq!(turn.status, "completed");
        assert_eq!(turn.response_text, "world");
        assert!(turn.completed_at.is_some());

        assert!(matches!(
            store
                .finalize_turn(FinalizeTurnParams {
                    turn_id: "tu_missing".into(),
                    status: "failed".into(),
                    ..Default::default()
                })
                .await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn summary_update_requires_existing_thread() {
        let (store, thread) = store_with_thread().await;
        store
            .update_thread_summary(&thread.thread_id, "compacted")
            .await
            .expect("update summary");
        let loaded = store.get_thread(&thread.thread_id).await.expect("get");
        assert_eq!(loaded.summary, "compacted");

        assert!(matches!(
            store.update_thread_summary("th_missing", "x").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn internal_flag_round_trips() {
        let (store, thread) = store_with_thread().await;
        store
            .create_turn(CreateTurnParams {
                turn_id: "tu_internal".into(),
                thread_id: thread.thread_id.clone(),
                request_text: "summarize".into(),
                is_internal: true,
                ..Default::default()
            })
            .await
            .expect("create turn");

        let turns = store
            .list_turns_by_thread(&thread.thread_id)
            .await
            .expect("list turns");
        assert_eq!(turns.len(), 1);
        assert!(turns[0].is_internal);
        assert_eq!(turns[0].status, "running");
    }
}
