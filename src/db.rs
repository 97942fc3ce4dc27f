//! Task Repository (component A): a durable catalog of tasks backed by SQLite.
//!
//! Queries are runtime-checked (`sqlx::query`/`query_as` with `.bind()`) rather than the
//! compile-time `sqlx::query!` macro, since validating that macro's query metadata requires
//! a live database connection at build time.

use sqlx::{sqlite::SqlitePoolOptions, FromRow, Row, SqlitePool};

use crate::error::AppError;
use crate::model::{Task, TaskKind, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
  id TEXT PRIMARY KEY, url TEXT NOT NULL, title TEXT NOT NULL,
  type INTEGER NOT NULL, savePath TEXT,
  status INTEGER NOT NULL, progress REAL NOT NULL,
  downloadedBytes INTEGER NOT NULL, totalBytes INTEGER NOT NULL,
  error TEXT, m3u8Key TEXT, m3u8IV TEXT
)
"#;

#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct DownloadRow {
    id: String,
    url: String,
    title: String,
    r#type: i64,
    #[sqlx(rename = "savePath")]
    save_path: Option<String>,
    status: i64,
    progress: f64,
    #[sqlx(rename = "downloadedBytes")]
    downloaded_bytes: i64,
    #[sqlx(rename = "totalBytes")]
    total_bytes: i64,
    error: Option<String>,
    #[sqlx(rename = "m3u8Key")]
    m3u8_key: Option<String>,
    #[sqlx(rename = "m3u8IV")]
    m3u8_iv: Option<String>,
}

impl DownloadRow {
    fn into_task(self) -> Option<Task> {
        Some(Task {
            id: self.id,
            url: self.url,
            title: self.title,
            kind: TaskKind::from_ordinal(self.r#type)?,
            save_path: self.save_path,
            status: TaskStatus::from_ordinal(self.status)?,
            progress: self.progress as f32,
            downloaded_units: self.downloaded_bytes,
            total_units: self.total_bytes,
            error: self.error,
            key: self.m3u8_key,
            iv: self.m3u8_iv,
            cancel_handle: None,
        })
    }
}

impl Repository {
    /// Open (creating if absent) the SQLite database at `path`.
    pub async fn connect(path: &std::path::Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .map_err(AppError::from)?;
        Ok(Repository { pool })
    }

    /// In-memory database, for tests.
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(AppError::from)?;
        Ok(Repository { pool })
    }

    /// Create schema if absent; idempotent.
    pub async fn initialize(&self) -> Result<(), AppError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<Task>, AppError> {
        let rows = sqlx::query_as::<_, DownloadRow>("SELECT * FROM downloads")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(DownloadRow::into_task).collect())
    }

    pub async fn upsert(&self, task: &Task) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO downloads
               (id, url, title, type, savePath, status, progress, downloadedBytes, totalBytes, error, m3u8Key, m3u8IV)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               url = excluded.url, title = excluded.title, type = excluded.type,
               savePath = excluded.savePath, status = excluded.status, progress = excluded.progress,
               downloadedBytes = excluded.downloadedBytes, totalBytes = excluded.totalBytes,
               error = excluded.error, m3u8Key = excluded.m3u8Key, m3u8IV = excluded.m3u8IV",
        )
        .bind(&task.id)
        .bind(&task.url)
        .bind(&task.title)
        .bind(task.kind.as_ordinal())
        .bind(&task.save_path)
        .bind(task.status.as_ordinal())
        .bind(task.progress as f64)
        .bind(task.downloaded_units)
        .bind(task.total_units)
        .bind(&task.error)
        .bind(&task.key)
        .bind(&task.iv)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn count(&self) -> i64 {
        let row = sqlx::query("SELECT COUNT(*) as c FROM downloads")
            .fetch_one(&self.pool)
            .await
            .unwrap();
        row.get::<i64, _>("c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: "abc".into(),
            url: "http://example.com/video.mp4".into(),
            title: "Example".into(),
            kind: TaskKind::Mp4,
            save_path: Some("/tmp/abc.mp4".into()),
            status: TaskStatus::Downloading,
            progress: 0.42,
            downloaded_units: 420,
            total_units: 1000,
            error: None,
            key: None,
            iv: None,
            cancel_handle: None,
        }
    }

    #[tokio::test]
    async fn round_trips_a_task() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.initialize().await.unwrap();
        let task = sample_task();
        repo.upsert(&task).await.unwrap();
        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let reloaded = &loaded[0];
        assert_eq!(reloaded.id, task.id);
        assert_eq!(reloaded.url, task.url);
        assert_eq!(reloaded.title, task.title);
        assert_eq!(reloaded.kind, task.kind);
        assert_eq!(reloaded.save_path, task.save_path);
        assert_eq!(reloaded.status, task.status);
        assert_eq!(reloaded.downloaded_units, task.downloaded_units);
        assert_eq!(reloaded.total_units, task.total_units);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row_by_id() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.initialize().await.unwrap();
        let mut task = sample_task();
        repo.upsert(&task).await.unwrap();
        task.status = TaskStatus::Completed;
        task.progress = 1.0;
        repo.upsert(&task).await.unwrap();
        assert_eq!(repo.count().await, 1);
        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.initialize().await.unwrap();
        let task = sample_task();
        repo.upsert(&task).await.unwrap();
        repo.delete(&task.id).await.unwrap();
        assert_eq!(repo.count().await, 0);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.initialize().await.unwrap();
        repo.initialize().await.unwrap();
    }
}
