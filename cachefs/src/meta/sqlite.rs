//! SQLite-backed MetaStore.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::{AccessCount, DirtyFile, MetaStore, RemoteFile, SyncOutcome, now_secs};
use crate::error::MetaResult;
use crate::vfs::attr::{FileAttr, unix_secs};
use crate::vfs::path::split_virtual;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        filename TEXT NOT NULL,
        directory TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        mode INTEGER NOT NULL,
        uid INTEGER NOT NULL DEFAULT 0,
        gid INTEGER NOT NULL DEFAULT 0,
        atime INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        ctime INTEGER NOT NULL,
        is_directory BOOLEAN NOT NULL DEFAULT FALSE,
        needs_sync BOOLEAN NOT NULL DEFAULT FALSE,
        last_synced INTEGER,
        remote_id TEXT,
        version INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_files_directory ON files(directory)",
    "CREATE INDEX IF NOT EXISTS idx_files_needs_sync ON files(needs_sync)",
    "CREATE TABLE IF NOT EXISTS access_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        access_time INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        sync_time INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT
    )",
];

#[derive(Debug, Clone)]
pub struct SqliteMetaStore {
    pool: Arc<SqlitePool>,
}

impl SqliteMetaStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> MetaResult<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Self::with_pool(Arc::new(pool)).await
    }

    pub async fn with_pool(pool: Arc<SqlitePool>) -> MetaResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> MetaResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(self.pool.as_ref()).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }
}

/// `path/` and its length in characters, for `substr` prefix matches.
fn subtree_prefix(path: &str) -> (String, i64) {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    let len = prefix.chars().count() as i64;
    (prefix, len)
}

async fn delete_tree<'c, E>(exec: E, path: &str) -> MetaResult<u64>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let (prefix, len) = subtree_prefix(path);
    let res = sqlx::query("DELETE FROM files WHERE path = ? OR substr(path, 1, ?) = ?")
        .bind(path)
        .bind(len)
        .bind(prefix)
        .execute(exec)
        .await?;
    Ok(res.rows_affected())
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn record_file_created(&self, path: &str, mode: u32) -> MetaResult<()> {
        let (directory, filename) = split_virtual(path);
        let now = now_secs();
        sqlx::query(
            "INSERT INTO files (path, filename, directory, mode, atime, mtime, ctime, is_directory, needs_sync, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, FALSE, TRUE, 1)
             ON CONFLICT(path) DO UPDATE SET
                mode = excluded.mode,
                mtime = excluded.mtime,
                ctime = excluded.ctime,
                needs_sync = TRUE,
                version = files.version + 1",
        )
        .bind(path)
        .bind(filename)
        .bind(directory)
        .bind(mode as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn record_directory_created(&self, path: &str, mode: u32) -> MetaResult<()> {
        let (directory, filename) = split_virtual(path);
        let now = now_secs();
        sqlx::query(
            "INSERT INTO files (path, filename, directory, mode, atime, mtime, ctime, is_directory)
             VALUES (?, ?, ?, ?, ?, ?, ?, TRUE)
             ON CONFLICT(path) DO UPDATE SET
                mode = excluded.mode,
                mtime = excluded.mtime,
                ctime = excluded.ctime",
        )
        .bind(path)
        .bind(filename)
        .bind(directory)
        .bind(mode as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn record_removed(&self, path: &str) -> MetaResult<()> {
        delete_tree(self.pool.as_ref(), path).await?;
        Ok(())
    }

    async fn record_renamed(&self, old: &str, new: &str) -> MetaResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(old)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(());
        }

        delete_tree(&mut *tx, new).await?;

        let (directory, filename) = split_virtual(new);
        sqlx::query(
            "UPDATE files SET path = ?, filename = ?, directory = ?,
                needs_sync = CASE WHEN is_directory THEN needs_sync ELSE TRUE END,
                version = version + 1
             WHERE path = ?",
        )
        .bind(new)
        .bind(filename)
        .bind(directory)
        .bind(old)
        .execute(&mut *tx)
        .await?;

        // Descendants keep their filename; path and directory share the old prefix.
        let (old_prefix, len) = subtree_prefix(old);
        sqlx::query(
            "UPDATE files SET
                path = ? || substr(path, ?),
                directory = ? || substr(directory, ?)
             WHERE substr(path, 1, ?) = ?",
        )
        .bind(new)
        .bind(len)
        .bind(new)
        .bind(len)
        .bind(len)
        .bind(old_prefix)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_attributes(&self, path: &str, attr: &FileAttr) -> MetaResult<()> {
        if path == "/" {
            return Ok(());
        }
        let (directory, filename) = split_virtual(path);
        let is_dir = attr.is_dir();
        sqlx::query(
            "INSERT INTO files (path, filename, directory, size, mode, uid, gid, atime, mtime, ctime,
                                is_directory, needs_sync, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                mode = excluded.mode,
                uid = excluded.uid,
                gid = excluded.gid,
                atime = excluded.atime,
                mtime = excluded.mtime,
                ctime = excluded.ctime",
        )
        .bind(path)
        .bind(filename)
        .bind(directory)
        .bind(attr.size as i64)
        .bind(attr.mode as i64)
        .bind(attr.uid as i64)
        .bind(attr.gid as i64)
        .bind(unix_secs(attr.atime))
        .bind(unix_secs(attr.mtime))
        .bind(unix_secs(attr.ctime))
        .bind(is_dir)
        .bind(!is_dir)
        .bind(if is_dir { 0_i64 } else { 1 })
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn update_size(&self, path: &str, size: u64) -> MetaResult<()> {
        sqlx::query("UPDATE files SET size = ? WHERE path = ?")
            .bind(size as i64)
            .bind(path)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn update_access_time(&self, path: &str) -> MetaResult<()> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query("UPDATE files SET atime = ? WHERE path = ?")
            .bind(now)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() > 0 {
            sqlx::query(
                "INSERT INTO access_history (file_id, access_time)
                 SELECT id, ? FROM files WHERE path = ?",
            )
            .bind(now)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_modify_time(&self, path: &str) -> MetaResult<()> {
        sqlx::query("UPDATE files SET mtime = ? WHERE path = ?")
            .bind(now_secs())
            .bind(path)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn list_directory_children(&self, dir: &str) -> MetaResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT filename FROM files WHERE directory = ? ORDER BY filename",
        )
        .bind(dir)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(names)
    }

    async fn mark_dirty(&self, path: &str) -> MetaResult<()> {
        sqlx::query("UPDATE files SET needs_sync = TRUE, version = version + 1 WHERE path = ?")
            .bind(path)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn list_dirty_files(&self, limit: usize) -> MetaResult<Vec<DirtyFile>> {
        let rows = sqlx::query_as::<_, (i64, String, i64, i64, i64)>(
            "SELECT id, path, size, mtime, version FROM files
             WHERE needs_sync AND NOT is_directory
             ORDER BY mtime ASC, id ASC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, path, size, mtime, version)| DirtyFile {
                id,
                path,
                size: size.max(0) as u64,
                mtime,
                version,
            })
            .collect())
    }

    async fn record_sync_result(
        &self,
        file: &DirtyFile,
        outcome: &SyncOutcome,
    ) -> MetaResult<bool> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let mut cleared = false;
        if outcome.success {
            let res = sqlx::query(
                "UPDATE files SET needs_sync = FALSE, last_synced = ?, remote_id = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(now)
            .bind(outcome.remote_id.as_deref())
            .bind(file.id)
            .bind(file.version)
            .execute(&mut *tx)
            .await?;
            cleared = res.rows_affected() > 0;
        }
        if !cleared {
            sqlx::query("UPDATE files SET last_synced = ? WHERE id = ?")
                .bind(now)
                .bind(file.id)
                .execute(&mut *tx)
                .await?;
        }

        let status = if outcome.success { "success" } else { "failed" };
        sqlx::query(
            "INSERT INTO sync_history (file_id, sync_time, status, error_message)
             SELECT id, ?, ?, ? FROM files WHERE id = ?",
        )
        .bind(now)
        .bind(status)
        .bind(outcome.error.as_deref())
        .bind(file.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(cleared)
    }

    async fn most_accessed(&self, limit: usize) -> MetaResult<Vec<AccessCount>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT f.path, f.size, COUNT(a.id) AS hits
             FROM files f JOIN access_history a ON f.id = a.file_id
             WHERE NOT f.is_directory
             GROUP BY f.id
             ORDER BY hits DESC, f.path ASC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(path, size, count)| AccessCount {
                path,
                size: size.max(0) as u64,
                count: count.max(0) as u64,
            })
            .collect())
    }

    async fn files_with_remote_ids(&self) -> MetaResult<Vec<RemoteFile>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT path, remote_id FROM files
             WHERE remote_id IS NOT NULL AND remote_id != ''
             ORDER BY path",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(path, remote_id)| RemoteFile { path, remote_id })
            .collect())
    }
}
