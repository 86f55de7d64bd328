//! SQLite-backed tracking store
//!
//! The tracker is the single source of truth for what work remains. Every
//! mutating call commits before it returns, so a crash between two calls
//! leaves the database consistent with one of them having fully happened.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use crate::error::TrackerError;
use crate::models::{
    FetchRun, Label, LabelId, MessageId, MessageStatus, MessageStub, RunCounts, RunId, RunStatus,
    StatusCounts, StatusUpdate, ThreadId, TrackedMessage,
};

/// Database migrations, tracked through the user_version pragma
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One row per message identifier ever discovered
            CREATE TABLE messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                label_id TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'fetched', 'converted', 'failed')),
                subject TEXT NOT NULL DEFAULT '',
                sender TEXT NOT NULL DEFAULT '',
                recipients TEXT NOT NULL DEFAULT '',
                date TEXT NOT NULL DEFAULT '',
                raw_text_path TEXT,
                raw_html_path TEXT,
                markdown_path TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX idx_messages_status ON messages(status, created_at);
            CREATE INDEX idx_messages_label ON messages(label_id);

            -- Label ID -> display name lookup, synced wholesale
            CREATE TABLE labels (
                label_id TEXT PRIMARY KEY,
                label_name TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Labels on messages (many-to-many), written at fetch time.
            -- label_id is not a foreign key: labels may not be synced yet.
            CREATE TABLE message_labels (
                message_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, label_id),
                FOREIGN KEY (message_id) REFERENCES messages(message_id) ON DELETE CASCADE
            );

            -- Audit log of pipeline runs
            CREATE TABLE fetch_runs (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                label_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                ids_discovered INTEGER NOT NULL DEFAULT 0,
                messages_fetched INTEGER NOT NULL DEFAULT 0,
                messages_converted INTEGER NOT NULL DEFAULT 0,
                messages_failed INTEGER NOT NULL DEFAULT 0,
                status TEXT
            );
            "#,
        ),
        // Migration 2: Remaining header fields needed to rebuild front matter
        M::up(
            r#"
            ALTER TABLE messages ADD COLUMN cc TEXT NOT NULL DEFAULT '';
            ALTER TABLE messages ADD COLUMN message_id_header TEXT NOT NULL DEFAULT '';
            "#,
        ),
    ])
}

/// Fixed-width UTC timestamp so that text ordering matches time ordering
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const MESSAGE_COLUMNS: &str = "message_id, thread_id, label_id, status, subject, sender,
     recipients, date, raw_text_path, raw_html_path, markdown_path, error_message,
     created_at, updated_at, cc, message_id_header";

fn row_to_tracked(row: &Row<'_>) -> rusqlite::Result<TrackedMessage> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<MessageStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(TrackedMessage {
        message_id: MessageId::new(row.get::<_, String>(0)?),
        thread_id: ThreadId::new(row.get::<_, String>(1)?),
        label_id: row.get(2)?,
        status,
        subject: row.get(4)?,
        sender: row.get(5)?,
        recipients: row.get(6)?,
        date: row.get(7)?,
        raw_text_path: row.get(8)?,
        raw_html_path: row.get(9)?,
        markdown_path: row.get(10)?,
        error_message: row.get(11)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        cc: row.get(14)?,
        message_id_header: row.get(15)?,
    })
}

/// Persistent per-message processing state
///
/// Owns its connection; dropping the tracker (or calling [`close`](Self::close))
/// releases it on every exit path.
pub struct FetchTracker {
    conn: Connection,
}

impl FetchTracker {
    /// Open (creating if needed) the tracking database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers proceed while the single writer commits.
        // synchronous = FULL so a returned call survives power loss.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self { conn })
    }

    /// Close the connection, surfacing any error from SQLite
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context("Failed to close tracking database")
    }

    // === Discovery ===

    /// Track a single message as pending. Returns false if already tracked.
    pub fn insert_pending(
        &self,
        message_id: &MessageId,
        thread_id: &ThreadId,
        label_id: &str,
    ) -> Result<bool> {
        let now = now_ts();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO messages
             (message_id, thread_id, label_id, status, created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, ?)",
            params![message_id.as_str(), thread_id.as_str(), label_id, now, now],
        )?;
        Ok(inserted > 0)
    }

    /// Track many messages as pending in one transaction, skipping known IDs.
    ///
    /// Returns the number of rows actually inserted.
    pub fn bulk_insert_pending(&self, stubs: &[MessageStub], label_id: &str) -> Result<usize> {
        let now = now_ts();
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO messages
                 (message_id, thread_id, label_id, status, created_at, updated_at)
                 VALUES (?, ?, ?, 'pending', ?, ?)",
            )?;
            for stub in stubs {
                inserted += stmt.execute(params![
                    stub.message_id.as_str(),
                    stub.thread_id.as_str(),
                    label_id,
                    now,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn is_tracked(&self, message_id: &MessageId) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE message_id = ?)",
            [message_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // === Work queues ===

    /// Pending message IDs in creation order
    pub fn get_pending_ids(&self, limit: usize, offset: usize) -> Result<Vec<MessageId>> {
        self.ids_with_status(MessageStatus::Pending, limit, offset)
    }

    /// Fetched (ready to convert) message IDs in creation order
    pub fn get_fetched_ids(&self, limit: usize, offset: usize) -> Result<Vec<MessageId>> {
        self.ids_with_status(MessageStatus::Fetched, limit, offset)
    }

    fn ids_with_status(
        &self,
        status: MessageStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT message_id FROM messages
             WHERE status = ?
             ORDER BY created_at, rowid
             LIMIT ? OFFSET ?",
        )?;

        let ids = stmt
            .query_map(
                params![status.as_str(), limit as i64, offset as i64],
                |row| Ok(MessageId::new(row.get::<_, String>(0)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    /// Full row for a message
    pub fn get_message(&self, message_id: &MessageId) -> Result<Option<TrackedMessage>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?"),
                [message_id.as_str()],
                row_to_tracked,
            )
            .optional()?;
        Ok(row)
    }

    // === Transitions ===

    /// Move one message to `status`, validating the transition.
    ///
    /// Errors if the message is untracked or the transition is not one of
    /// pending→fetched, pending→failed, fetched→converted, fetched→failed.
    /// The error message is stored only for `failed` and cleared otherwise;
    /// raw paths are stored only on `fetched`, the markdown path only on
    /// `converted`.
    pub fn update_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        update: StatusUpdate,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE message_id = ?",
                [message_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Err(TrackerError::UntrackedMessage(message_id.clone()).into());
        };
        let current: MessageStatus = current.parse()?;

        if !current.can_transition_to(status) {
            return Err(TrackerError::InvalidTransition {
                id: message_id.clone(),
                from: current,
                to: status,
            }
            .into());
        }

        // A fetch replaces both raw paths, so a refetch never keeps a stale body
        let fetched = status == MessageStatus::Fetched;
        let markdown = if status == MessageStatus::Converted {
            update.markdown_path
        } else {
            None
        };
        let error = if status == MessageStatus::Failed {
            Some(update.error_message.unwrap_or_else(|| "unknown error".to_string()))
        } else {
            None
        };

        tx.execute(
            "UPDATE messages SET
                status = ?1,
                updated_at = ?2,
                error_message = ?3,
                raw_text_path = CASE WHEN ?4 THEN ?5 ELSE raw_text_path END,
                raw_html_path = CASE WHEN ?4 THEN ?6 ELSE raw_html_path END,
                markdown_path = COALESCE(?7, markdown_path),
                subject = COALESCE(?8, subject),
                sender = COALESCE(?9, sender),
                recipients = COALESCE(?10, recipients),
                date = COALESCE(?11, date),
                cc = COALESCE(?12, cc),
                message_id_header = COALESCE(?13, message_id_header)
             WHERE message_id = ?14",
            params![
                status.as_str(),
                now_ts(),
                error,
                fetched,
                update.raw_text_path,
                update.raw_html_path,
                markdown,
                update.subject,
                update.sender,
                update.recipients,
                update.date,
                update.cc,
                update.message_id_header,
                message_id.as_str(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Reset every failed message to pending and clear its error.
    ///
    /// Returns the number of rows reset.
    pub fn retry_failed(&self) -> Result<usize> {
        let reset = self.conn.execute(
            "UPDATE messages SET status = 'pending', error_message = NULL, updated_at = ?
             WHERE status = 'failed'",
            [now_ts()],
        )?;
        if reset > 0 {
            log::info!("[TRACKER] Reset {} failed messages to pending", reset);
        }
        Ok(reset)
    }

    pub fn count_by_status(&self) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.set(status.parse()?, count as usize);
        }
        Ok(counts)
    }

    // === Labels ===

    /// Insert or rename labels. Returns the number of labels written.
    pub fn upsert_labels(&self, labels: &[Label]) -> Result<usize> {
        let now = now_ts();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO labels (label_id, label_name, updated_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(label_id) DO UPDATE SET
                    label_name = excluded.label_name,
                    updated_at = excluded.updated_at",
            )?;
            for label in labels {
                stmt.execute(params![label.id.as_str(), label.name, now])?;
            }
        }
        tx.commit()?;
        Ok(labels.len())
    }

    /// Record the labels a message carried when it was fetched
    pub fn insert_message_labels(&self, message_id: &MessageId, label_ids: &[String]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO message_labels (message_id, label_id, position)
                 VALUES (?, ?, ?)",
            )?;
            for (i, label_id) in label_ids.iter().enumerate() {
                stmt.execute(params![message_id.as_str(), label_id, i as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Labels of a message with display names, in the order Gmail reported them.
    ///
    /// Labels missing from the lookup table fall back to their ID as name.
    pub fn get_message_labels(&self, message_id: &MessageId) -> Result<Vec<Label>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ml.label_id, COALESCE(l.label_name, ml.label_id)
             FROM message_labels ml
             LEFT JOIN labels l ON ml.label_id = l.label_id
             WHERE ml.message_id = ?
             ORDER BY ml.position",
        )?;

        let labels = stmt
            .query_map([message_id.as_str()], |row| {
                Ok(Label {
                    id: LabelId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(labels)
    }

    // === Run audit ===

    pub fn start_run(&self, label_id: &str) -> Result<RunId> {
        self.conn.execute(
            "INSERT INTO fetch_runs (label_id, started_at) VALUES (?, ?)",
            params![label_id, now_ts()],
        )?;
        Ok(RunId(self.conn.last_insert_rowid()))
    }

    pub fn complete_run(&self, run: RunId, counts: RunCounts, status: RunStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE fetch_runs SET
                completed_at = ?, ids_discovered = ?, messages_fetched = ?,
                messages_converted = ?, messages_failed = ?, status = ?
             WHERE run_id = ?",
            params![
                now_ts(),
                counts.ids_discovered as i64,
                counts.messages_fetched as i64,
                counts.messages_converted as i64,
                counts.messages_failed as i64,
                status.as_str(),
                run.0,
            ],
        )?;
        anyhow::ensure!(updated == 1, "Unknown run id {}", run.0);
        Ok(())
    }

    /// Most recent runs first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<FetchRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, label_id, started_at, completed_at, ids_discovered,
                    messages_fetched, messages_converted, messages_failed, status
             FROM fetch_runs
             ORDER BY run_id DESC
             LIMIT ?",
        )?;

        let runs = stmt
            .query_map([limit as i64], |row| {
                let started_at: String = row.get(2)?;
                let completed_at: Option<String> = row.get(3)?;
                let status: Option<String> = row.get(8)?;
                Ok(FetchRun {
                    id: RunId(row.get(0)?),
                    label_id: row.get(1)?,
                    started_at: parse_ts(&started_at),
                    completed_at: completed_at.as_deref().map(parse_ts),
                    counts: RunCounts {
                        ids_discovered: row.get::<_, i64>(4)? as usize,
                        messages_fetched: row.get::<_, i64>(5)? as usize,
                        messages_converted: row.get::<_, i64>(6)? as usize,
                        messages_failed: row.get::<_, i64>(7)? as usize,
                    },
                    status: status.as_deref().and_then(RunStatus::parse),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }
}
