use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::clock::{ServerClock, SystemClock};
use super::error::{
    CreateSqliteDirectorySnafu, InMemoryDatabaseSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, StorageResult,
};
use super::error::{
    InvariantViolationSnafu, NotFoundSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu,
    SqliteThreadSpawnSnafu,
};
use super::feed::{ChangeFeed, TopicWatch};
use super::ids::{MessageId, TopicId};
use super::types::{MessageRecord, NewMessage, ServerTimestamp, StoredDocument};
use super::MessageStore;

/// Durable message store on a local SQLite file.
///
/// Change notification is process-local: writers in other processes are not observed
/// until the next local write to the same topic.
#[derive(Clone)]
pub struct SqliteMessageStore {
    database_url: String,
    feed: Arc<ChangeFeed>,
    clock: Arc<dyn ServerClock>,
    // Serializes local writers so the read-then-insert in append never races a
    // deferred transaction upgrade into SQLITE_BUSY.
    write_lock: Arc<Mutex<()>>,
}

impl SqliteMessageStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_clock(database_location, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        database_location: &str,
        clock: Arc<dyn ServerClock>,
    ) -> StorageResult<Self> {
        // Every call opens its own connection, and each in-memory connection is a
        // separate empty database.
        if is_in_memory_location(database_location) {
            return InMemoryDatabaseSnafu {
                stage: "sqlite-open-location",
                database_location,
            }
            .fail();
        }
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Trait calls open their own connections; the bootstrap pool is done.
        pool.close().await;
        tracing::info!(database_url = %database_url, "opened sqlite message store");

        Ok(Self {
            database_url,
            feed: Arc::new(ChangeFeed::new()),
            clock,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl MessageStore for SqliteMessageStore {
    fn append_message(&self, topic_id: TopicId, input: NewMessage) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        let _write_guard = self.write_lock.lock();
        let now = self.clock.now();
        let record = self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let high_water = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(timestamp_micros) FROM messages WHERE topic_id = ?",
            )
            .bind(topic_id.as_i64())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-high-water",
            })?;

            // Never order a new message before one that is already visible.
            let timestamp = high_water
                .map(ServerTimestamp::from_unix_micros)
                .map_or(now, |high| high.max(now));

            let record = MessageRecord {
                id: MessageId::new_v7(),
                topic_id,
                text: input.text,
                timestamp,
                author_display_name: input.author_display_name,
            };
            let document = record.document().to_json("message-append-encode")?;

            sqlx::query(
                "INSERT INTO messages (id, topic_id, timestamp_micros, document) VALUES (?, ?, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(topic_id.as_i64())
            .bind(timestamp.unix_micros())
            .bind(document)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(record)
        })?;

        self.feed.publish(topic_id);
        Ok(record)
    }

    fn delete_message(&self, topic_id: TopicId, message_id: MessageId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let _write_guard = self.write_lock.lock();
        self.run_db_call("message-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-delete-connect").await?;
            let result = sqlx::query("DELETE FROM messages WHERE topic_id = ? AND id = ?")
                .bind(topic_id.as_i64())
                .bind(message_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-delete-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })?;

        self.feed.publish(topic_id);
        Ok(())
    }

    fn load_documents(&self, topic_id: TopicId) -> StorageResult<Vec<StoredDocument>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-load", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-load-connect").await?;
            let rows = sqlx::query_as::<_, DocumentRow>(
                "SELECT id, topic_id, document FROM messages WHERE topic_id = ? ORDER BY timestamp_micros ASC, id ASC",
            )
            .bind(topic_id.as_i64())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-load-query",
            })?;

            Ok(rows.into_iter().map(document_row_to_stored).collect())
        })
    }

    fn watch_topic(&self, topic_id: TopicId) -> StorageResult<TopicWatch> {
        Ok(self.feed.watch(topic_id))
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    topic_id: i64,
    document: String,
}

fn document_row_to_stored(row: DocumentRow) -> StoredDocument {
    StoredDocument {
        id: row.id,
        topic_id: TopicId::new(row.topic_id),
        body: row.document,
    }
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn is_in_memory_location(database_location: &str) -> bool {
    database_location.contains(":memory:") || database_location.contains("mode=memory")
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StorageError;
    use crate::types::MessageDocument;
    use tempfile::TempDir;

    const TOPIC: TopicId = TopicId::new(3);

    async fn open_store(clock: Arc<dyn ServerClock>) -> (SqliteMessageStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("chat").join("messages.db");
        let store = SqliteMessageStore::open_with_clock(&path.display().to_string(), clock)
            .await
            .expect("Failed to open sqlite store");
        (store, temp_dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_then_load_returns_server_ordered_documents() {
        let clock = Arc::new(ManualClock::new(ServerTimestamp::from_unix_micros(100)));
        let (store, _temp_dir) = open_store(clock.clone()).await;

        let first = store
            .append_message(TOPIC, NewMessage::new("first", Some("Ada".to_string())))
            .expect("append first");
        clock.advance(10);
        let second = store
            .append_message(TOPIC, NewMessage::new("second", None))
            .expect("append second");

        let documents = store.load_documents(TOPIC).expect("load");
        let ids = documents.iter().map(|doc| doc.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![first.id.to_string(), second.id.to_string()]);

        let body: MessageDocument = serde_json::from_str(&documents[1].body).expect("decodes");
        assert_eq!(body.text, "second");
        assert_eq!(body.timestamp, ServerTimestamp::from_unix_micros(110));
        assert_eq!(body.author_display_name, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_clamps_timestamp_to_topic_high_water() {
        let clock = Arc::new(ManualClock::new(ServerTimestamp::from_unix_micros(900)));
        let (store, _temp_dir) = open_store(clock.clone()).await;

        let first = store
            .append_message(TOPIC, NewMessage::new("late clock", None))
            .expect("append");
        clock.set(ServerTimestamp::from_unix_micros(10));
        let second = store
            .append_message(TOPIC, NewMessage::new("skewed clock", None))
            .expect("append");

        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_is_permanent_and_missing_ids_report_not_found() {
        let (store, _temp_dir) = open_store(Arc::new(SystemClock)).await;
        let record = store
            .append_message(TOPIC, NewMessage::new("remove me", None))
            .expect("append");

        store.delete_message(TOPIC, record.id).expect("delete");
        assert!(store.load_documents(TOPIC).expect("load").is_empty());

        let error = store
            .delete_message(TOPIC, record.id)
            .expect_err("already deleted");
        assert!(error.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn topics_are_isolated() {
        let (store, _temp_dir) = open_store(Arc::new(SystemClock)).await;
        let record = store
            .append_message(TOPIC, NewMessage::new("mine", None))
            .expect("append");

        let other = TopicId::new(99);
        assert!(store.load_documents(other).expect("load").is_empty());
        assert!(store.delete_message(other, record.id).is_err());
        assert_eq!(store.load_documents(TOPIC).expect("load").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_memory_locations_are_rejected() {
        for location in [
            ":memory:",
            "sqlite::memory:",
            "sqlite:file:chat?mode=memory&cache=shared",
        ] {
            let error = match SqliteMessageStore::open(location).await {
                Ok(_) => panic!("{location} should be rejected"),
                Err(error) => error,
            };
            assert!(
                matches!(error, StorageError::InMemoryDatabase { .. }),
                "{location}: {error:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_writes_tick_the_topic_watch() {
        let (store, _temp_dir) = open_store(Arc::new(SystemClock)).await;
        let mut watch = store.watch_topic(TOPIC).expect("watch");

        store
            .append_message(TOPIC, NewMessage::new("ping", None))
            .expect("append");

        assert!(watch.has_changed().expect("feed open"));
        assert_eq!(*watch.borrow_and_update(), 1);
    }
}
