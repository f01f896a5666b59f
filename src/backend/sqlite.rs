//! SQLite backend.
//!
//! Every operation opens its own connection on a blocking thread and drops
//! it before returning, on success and failure alike. Commits run in a
//! `BEGIN IMMEDIATE` transaction, which takes the write lock up front so the
//! version check and the insert cannot interleave with another writer.
//!
//! Layout (per schema):
//!
//! ```text
//! streams          id_internal | id (sha256) | id_original | version | position
//! messages         position | stream_id_internal | stream_version | event_id
//!                  | created_utc | type | payload | metadata
//! stream_metadata  id | id_original | metadata_json
//! ```
//!
//! A non-default schema lives in its own database file. `initialize` creates
//! it; every other operation attaches it under the (quoted) schema name and
//! fails if it does not exist yet.

use super::{version_matches, CommitOutcome, EventBackend, StreamSlice};
use crate::error::{Result, StoreError};
use crate::types::{
    AppendResult, Checkpoint, ExpectedVersion, NewEvent, ReadDirection, StoredEvent, StreamId,
    StreamMetadata, StreamVersion, Timestamp,
};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Schema that needs no attach step.
pub const DEFAULT_SCHEMA: &str = "main";

/// Connection settings for [`SqliteBackend`].
#[derive(Clone, Debug)]
pub struct SqliteSettings {
    /// Database file.
    pub path: PathBuf,

    /// Schema (namespace) holding the tables.
    pub schema: String,

    /// Timestamps are supplied by the client; the column gets no default.
    pub client_timestamps: bool,

    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl SqliteSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            client_timestamps: false,
            busy_timeout: Duration::from_secs(5),
        }
    }

    fn is_default_schema(&self) -> bool {
        self.schema == DEFAULT_SCHEMA
    }

    /// File backing a non-default schema: `<stem>.<schema>.db` next to the main file.
    fn schema_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        self.path.with_file_name(format!("{}.{}.db", stem, self.schema))
    }

    fn schema_exists(&self) -> bool {
        self.is_default_schema() || self.schema_path().exists()
    }

    /// Open the main database and attach the schema file.
    ///
    /// The schema file is only created when `create_schema` is set.
    fn connect(&self, create_schema: bool) -> Result<Connection> {
        if !create_schema && !self.schema_exists() {
            return Err(StoreError::Backend(format!(
                "schema '{}' has not been initialized",
                self.schema
            )));
        }

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        if !self.is_default_schema() {
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", self.quoted_schema()),
                params![self.schema_path().to_string_lossy().into_owned()],
            )?;
        }
        Ok(conn)
    }

    /// Schema names pass [`is_schema_name`], so they never contain quotes.
    fn quoted_schema(&self) -> String {
        format!("\"{}\"", self.schema)
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.quoted_schema(), name)
    }
}

/// Backend storing events in SQLite.
pub struct SqliteBackend {
    settings: Arc<SqliteSettings>,
}

impl SqliteBackend {
    pub fn new(settings: SqliteSettings) -> Result<Self> {
        let path = settings.path.to_string_lossy();
        if path.is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "sqlite database path must not be empty".into(),
            ));
        }
        if path.starts_with(":memory:") || path.contains("mode=memory") {
            return Err(StoreError::InvalidConfiguration(
                "sqlite backend opens one connection per operation; in-memory databases are not shared"
                    .into(),
            ));
        }
        if !is_schema_name(&settings.schema) {
            return Err(StoreError::InvalidConfiguration(format!(
                "schema '{}' is not a usable schema name",
                settings.schema
            )));
        }

        Ok(Self {
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &SqliteSettings {
        &self.settings
    }

    /// Run `op` on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteSettings) -> Result<T> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        tokio::task::spawn_blocking(move || op(&settings))
            .await
            .map_err(|e| StoreError::Backend(format!("sqlite worker failed: {}", e)))?
    }

    /// Run `op` on a fresh connection to an initialized schema.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteSettings, &mut Connection) -> Result<T> + Send + 'static,
    {
        self.blocking(move |settings| {
            let mut conn = settings.connect(false)?;
            op(settings, &mut conn)
        })
        .await
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A plain identifier that does not collide with SQLite's built-in
/// `main` and `temp` databases.
pub(crate) fn is_schema_name(name: &str) -> bool {
    if !is_identifier(name) || name.eq_ignore_ascii_case("temp") {
        return false;
    }
    name == DEFAULT_SCHEMA || !name.eq_ignore_ascii_case(DEFAULT_SCHEMA)
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("negative position {} in store", value)))
}

fn create_tables_sql(settings: &SqliteSettings) -> String {
    let created_default = if settings.client_timestamps {
        ""
    } else {
        " DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000000 AS INTEGER))"
    };
    let s = settings.quoted_schema();

    format!(
        "CREATE TABLE IF NOT EXISTS {s}.streams (
            id_internal INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            id_original TEXT NOT NULL,
            version INTEGER NOT NULL,
            position INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {s}.messages (
            position INTEGER PRIMARY KEY,
            stream_id_internal INTEGER NOT NULL REFERENCES streams(id_internal),
            stream_version INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            created_utc INTEGER NOT NULL{created_default},
            type TEXT NOT NULL,
            payload BLOB NOT NULL,
            metadata BLOB NULL,
            UNIQUE (stream_id_internal, stream_version),
            UNIQUE (stream_id_internal, event_id)
        );
        CREATE INDEX IF NOT EXISTS {s}.ix_messages_stream_created
            ON messages (stream_id_internal, created_utc);
        CREATE TABLE IF NOT EXISTS {s}.stream_metadata (
            id TEXT PRIMARY KEY,
            id_original TEXT NOT NULL,
            metadata_json TEXT NOT NULL
        );"
    )
}

const EVENT_COLUMNS: &str = "m.event_id, s.id_original, m.stream_version, m.position, m.type, \
                             m.created_utc, m.payload, m.metadata";

/// Raw columns in `EVENT_COLUMNS` order.
type EventRow = (String, String, i64, i64, String, i64, Vec<u8>, Option<Vec<u8>>);

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<EventRow>>,
) -> Result<Vec<StoredEvent>> {
    let mut events = Vec::new();
    for row in rows {
        let (event_id, stream_id, version, position, event_type, created, payload, metadata) =
            row?;
        events.push(StoredEvent {
            event_id: Uuid::parse_str(&event_id)
                .map_err(|e| StoreError::Backend(format!("bad event id '{}': {}", event_id, e)))?,
            stream_id,
            stream_version: StreamVersion(from_sql(version)?),
            checkpoint: Checkpoint(from_sql(position)?),
            event_type,
            created: Timestamp(created),
            payload,
            metadata,
        });
    }
    Ok(events)
}

/// `(id_internal, version, position)` of a stream, if it exists.
fn stream_head(
    conn: &Connection,
    settings: &SqliteSettings,
    stream: &StreamId,
) -> Result<Option<(i64, i64, i64)>> {
    let sql = format!(
        "SELECT id_internal, version, position FROM {} WHERE id = ?1",
        settings.table("streams")
    );
    Ok(conn
        .query_row(&sql, params![stream.internal()], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .optional()?)
}

#[async_trait]
impl EventBackend for SqliteBackend {
    async fn initialize(&self) -> Result<()> {
        self.blocking(|settings| {
            let fresh_schema = !settings.schema_exists();
            let conn = settings.connect(true)?;
            if fresh_schema {
                info!(
                    target: "stream_store::sqlite",
                    schema = %settings.schema,
                    path = ?settings.schema_path(),
                    "Created schema"
                );
            }
            conn.execute_batch(&create_tables_sql(settings))?;
            Ok(())
        })
        .await
    }

    async fn drop_all(&self) -> Result<()> {
        self.blocking(|settings| {
            // A schema that was never created holds nothing to drop.
            if !settings.schema_exists() {
                return Ok(());
            }
            let conn = settings.connect(false)?;
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {m};
                 DROP TABLE IF EXISTS {s};
                 DROP TABLE IF EXISTS {md};",
                m = settings.table("messages"),
                s = settings.table("streams"),
                md = settings.table("stream_metadata"),
            ))?;
            Ok(())
        })
        .await
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[NewEvent],
        created: Option<Timestamp>,
    ) -> Result<CommitOutcome> {
        let stream = stream.clone();
        let events = events.to_vec();

        self.with_connection(move |settings, conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let head = stream_head(&tx, settings, &stream)?;
            let actual = match head {
                Some((_, version, _)) => Some(StreamVersion(from_sql(version)?)),
                None => None,
            };

            if !version_matches(expected, actual) {
                return Ok(CommitOutcome::WrongVersion { actual });
            }
            if events.is_empty() {
                return Ok(CommitOutcome::WrongVersion { actual });
            }

            let id_internal = match head {
                Some((id_internal, _, _)) => {
                    let sql = format!(
                        "SELECT 1 FROM {} WHERE stream_id_internal = ?1 AND event_id = ?2",
                        settings.table("messages")
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    for event in &events {
                        if stmt.exists(params![id_internal, event.event_id.to_string()])? {
                            return Ok(CommitOutcome::DuplicateEvent { actual });
                        }
                    }
                    id_internal
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (id, id_original, version, position) VALUES (?1, ?2, -1, -1)",
                            settings.table("streams")
                        ),
                        params![stream.internal(), stream.as_str()],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            let mut position: i64 = tx.query_row(
                &format!(
                    "SELECT COALESCE(MAX(position), -1) FROM {}",
                    settings.table("messages")
                ),
                [],
                |r| r.get(0),
            )?;
            let mut version = actual.map(|v| to_sql(v.0)).unwrap_or(-1);

            {
                let messages = settings.table("messages");
                let (sql, with_created) = match created {
                    Some(_) => (
                        format!(
                            "INSERT INTO {} (position, stream_id_internal, stream_version, event_id, \
                             type, payload, metadata, created_utc) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                            messages
                        ),
                        true,
                    ),
                    None => (
                        format!(
                            "INSERT INTO {} (position, stream_id_internal, stream_version, event_id, \
                             type, payload, metadata) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            messages
                        ),
                        false,
                    ),
                };
                let mut insert = tx.prepare(&sql)?;

                for event in &events {
                    position += 1;
                    version += 1;
                    let event_id = event.event_id.to_string();
                    if with_created {
                        let created = created.map(|t| t.0).unwrap_or_default();
                        insert.execute(params![
                            position,
                            id_internal,
                            version,
                            event_id,
                            event.event_type,
                            event.payload,
                            event.metadata,
                            created
                        ])?;
                    } else {
                        insert.execute(params![
                            position,
                            id_internal,
                            version,
                            event_id,
                            event.event_type,
                            event.payload,
                            event.metadata
                        ])?;
                    }
                }
            }

            tx.execute(
                &format!(
                    "UPDATE {} SET version = ?1, position = ?2 WHERE id_internal = ?3",
                    settings.table("streams")
                ),
                params![version, position, id_internal],
            )?;
            tx.commit()?;

            Ok(CommitOutcome::Committed(AppendResult {
                current_version: StreamVersion(from_sql(version)?),
                current_checkpoint: Checkpoint(from_sql(position)?),
            }))
        })
        .await
    }

    async fn find_event_version(
        &self,
        stream: &StreamId,
        event_id: Uuid,
    ) -> Result<Option<StreamVersion>> {
        let stream = stream.clone();
        self.with_connection(move |settings, conn| {
            let sql = format!(
                "SELECT m.stream_version FROM {} m JOIN {} s ON s.id_internal = m.stream_id_internal \
                 WHERE s.id = ?1 AND m.event_id = ?2",
                settings.table("messages"),
                settings.table("streams")
            );
            let version: Option<i64> = conn
                .query_row(&sql, params![stream.internal(), event_id.to_string()], |r| r.get(0))
                .optional()?;
            version.map(|v| from_sql(v).map(StreamVersion)).transpose()
        })
        .await
    }

    async fn read_stream(
        &self,
        stream: &StreamId,
        from: StreamVersion,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Option<StreamSlice>> {
        let stream = stream.clone();
        self.with_connection(move |settings, conn| {
            let Some((id_internal, version, position)) = stream_head(conn, settings, &stream)?
            else {
                return Ok(None);
            };

            let (cmp, order) = match direction {
                ReadDirection::Forwards => (">=", "ASC"),
                ReadDirection::Backwards => ("<=", "DESC"),
            };
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM {} m JOIN {} s ON s.id_internal = m.stream_id_internal \
                 WHERE m.stream_id_internal = ?1 AND m.stream_version {cmp} ?2 \
                 ORDER BY m.stream_version {order} LIMIT ?3",
                settings.table("messages"),
                settings.table("streams"),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![id_internal, to_sql(from.0), to_sql(max_count as u64)],
                event_from_row,
            )?;
            let events = collect_events(rows)?;

            Ok(Some(StreamSlice {
                last_version: StreamVersion(from_sql(version)?),
                last_checkpoint: Checkpoint(from_sql(position)?),
                events,
            }))
        })
        .await
    }

    async fn read_all(
        &self,
        from: Checkpoint,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Vec<StoredEvent>> {
        self.with_connection(move |settings, conn| {
            let (cmp, order) = match direction {
                ReadDirection::Forwards => (">=", "ASC"),
                ReadDirection::Backwards => ("<=", "DESC"),
            };
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM {} m JOIN {} s ON s.id_internal = m.stream_id_internal \
                 WHERE m.position {cmp} ?1 ORDER BY m.position {order} LIMIT ?2",
                settings.table("messages"),
                settings.table("streams"),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![to_sql(from.0), to_sql(max_count as u64)],
                event_from_row,
            )?;
            collect_events(rows)
        })
        .await
    }

    async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.with_connection(|settings, conn| {
            let head: Option<i64> = conn.query_row(
                &format!("SELECT MAX(position) FROM {}", settings.table("messages")),
                [],
                |r| r.get(0),
            )?;
            head.map(|h| from_sql(h).map(Checkpoint)).transpose()
        })
        .await
    }

    async fn count_events(
        &self,
        stream: &StreamId,
        created_before: Option<Timestamp>,
    ) -> Result<u64> {
        let stream = stream.clone();
        self.with_connection(move |settings, conn| {
            let base = format!(
                "SELECT COUNT(*) FROM {} m JOIN {} s ON s.id_internal = m.stream_id_internal \
                 WHERE s.id = ?1",
                settings.table("messages"),
                settings.table("streams")
            );
            let count: i64 = match created_before {
                Some(before) => conn.query_row(
                    &format!("{} AND m.created_utc < ?2", base),
                    params![stream.internal(), before.0],
                    |r| r.get(0),
                )?,
                None => conn.query_row(&base, params![stream.internal()], |r| r.get(0))?,
            };
            from_sql(count)
        })
        .await
    }

    async fn read_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>> {
        let stream = stream.clone();
        self.with_connection(move |settings, conn| {
            let json: Option<String> = conn
                .query_row(
                    &format!(
                        "SELECT metadata_json FROM {} WHERE id = ?1",
                        settings.table("stream_metadata")
                    ),
                    params![stream.internal()],
                    |r| r.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn write_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<()> {
        let stream = stream.clone();
        let json = serde_json::to_string(metadata)?;
        self.with_connection(move |settings, conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (id, id_original, metadata_json) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(id) DO UPDATE SET metadata_json = excluded.metadata_json",
                    settings.table("stream_metadata")
                ),
                params![stream.internal(), stream.as_str(), json],
            )?;
            Ok(())
        })
        .await
    }
}
