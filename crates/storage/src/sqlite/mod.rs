use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::{BoxFuture, LocalStore, Namespace};

/// SQLite-backed [`LocalStore`].
///
/// Every namespace lives in the single `kv_entries` table; values are opaque
/// JSON strings owned by the caller.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // An in-memory database lives exactly as long as its connection.
        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
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

        tracing::debug!(database_url = %database_url, "opened local sqlite store");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl LocalStore for SqliteStore {
    fn get<'a>(
        &'a self,
        namespace: Namespace,
        key: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, String>(
                "SELECT value FROM kv_entries WHERE namespace = ? AND key = ?",
            )
            .bind(namespace.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage: "kv-get" })
        })
    }

    fn put<'a>(
        &'a self,
        namespace: Namespace,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO kv_entries (namespace, key, value, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(namespace.as_str())
            .bind(key)
            .bind(value)
            .bind(crate::unix_timestamp_millis() as i64)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage: "kv-put" })?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, namespace: Namespace, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM kv_entries WHERE namespace = ? AND key = ?")
                .bind(namespace.as_str())
                .bind(key)
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu { stage: "kv-remove" })?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn keys<'a>(&'a self, namespace: Namespace) -> BoxFuture<'a, StorageResult<Vec<String>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, String>(
                "SELECT key FROM kv_entries WHERE namespace = ? ORDER BY key ASC",
            )
            .bind(namespace.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage: "kv-keys" })
        })
    }
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
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

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopening_the_database_file() {
        let directory = tempfile::tempdir().expect("tempdir");
        let location = directory.path().join("nested").join("local.db");
        let location = location.to_string_lossy().to_string();

        let store = SqliteStore::open(&location).await.expect("open");
        store
            .put(Namespace::Messages, "session-a", "[1]".to_string())
            .await
            .expect("put");
        store
            .put(Namespace::Messages, "session-a", "[1,2]".to_string())
            .await
            .expect("overwrite");
        store.close().await;

        let reopened = SqliteStore::open(&location).await.expect("reopen");
        let value = reopened
            .get(Namespace::Messages, "session-a")
            .await
            .expect("get");
        assert_eq!(value.as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn namespaces_are_isolated_and_keys_are_sorted() {
        let store = SqliteStore::open(":memory:").await.expect("open");
        for key in ["b", "a", "c"] {
            store
                .put(Namespace::Metadata, key, "{}".to_string())
                .await
                .expect("put");
        }
        store
            .put(Namespace::Messages, "z", "[]".to_string())
            .await
            .expect("put");

        let keys = store.keys(Namespace::Metadata).await.expect("keys");
        assert_eq!(keys, vec!["a", "b", "c"]);

        assert!(store.remove(Namespace::Metadata, "b").await.expect("remove"));
        assert!(!store.remove(Namespace::Metadata, "b").await.expect("remove twice"));
        assert_eq!(
            store.get(Namespace::Metadata, "z").await.expect("get"),
            None
        );
    }
}
