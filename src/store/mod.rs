//! Durable record of every download and its segments.
//!
//! The store is the single writer of durable state and the sole authority for
//! resume after a restart. Each [`Store::save`] rewrites the download row and
//! all of its segment rows inside one transaction, so readers never observe a
//! half-applied state change.
//!
//! # Example
//!
//! ```ignore
//! use segfetch_core::store::Store;
//! use segfetch_core::Database;
//! use std::path::Path;
//!
//! let db = Database::new(Path::new("segfetch.db")).await?;
//! let store = Store::new(db);
//! for model in store.load_all().await? {
//!     println!("{} {}", model.id, model.status);
//! }
//! ```

mod error;
mod repository;
mod rows;

pub use error::{StoreDbErrorKind, StoreError};
pub use repository::DownloadRepository;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::db::Database;
use crate::model::{DownloadModel, DownloadStatus, NewDownload, SegmentState};
use rows::{DownloadRow, SegmentRow, opt_to_db, to_db};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::NotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::NotFound(id))
    } else {
        Ok(())
    }
}

/// Extra attempts for a checkpoint that hits a busy or locked database.
const BUSY_RETRIES: u32 = 3;

/// Wait before the first busy retry; grows linearly.
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// Runs `op` again while it fails with a busy/locked database error.
async fn retry_when_busy<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(e) if e.is_busy_or_locked() && attempt < BUSY_RETRIES => {
                attempt += 1;
                warn!(attempt, error = %e, "database busy, retrying checkpoint");
                tokio::time::sleep(BUSY_BACKOFF * attempt).await;
            }
            other => return other,
        }
    }
}

/// `SQLite`-backed persistence for downloads.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a Queued download with no plan yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, new), fields(url = %new.source_url))]
    pub async fn create(&self, new: &NewDownload) -> Result<DownloadModel> {
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO downloads
                (source_url, destination_path, display_name, status, priority,
                 expected_size, expected_sha256)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&new.source_url)
        .bind(new.destination_path.to_string_lossy().as_ref())
        .bind(&new.display_name)
        .bind(DownloadStatus::Queued.as_str())
        .bind(new.priority)
        .bind(opt_to_db(0, new.expected_size)?)
        .bind(new.expected_sha256.as_deref())
        .fetch_one(self.db.pool())
        .await?;

        self.load(id).await?.ok_or(StoreError::NotFound(id))
    }

    /// Persists the download row and replaces its segment rows atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the download does not exist,
    /// [`StoreError::Database`] if the transaction fails. A busy or locked
    /// database is retried a few times before the error is returned.
    #[instrument(skip(self, model), fields(download_id = model.id, status = %model.status))]
    pub async fn save(&self, model: &DownloadModel) -> Result<()> {
        retry_when_busy(|| self.save_once(model)).await
    }

    async fn save_once(&self, model: &DownloadModel) -> Result<()> {
        let id = model.id;
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            r"UPDATE downloads
              SET source_url = ?, destination_path = ?, display_name = ?,
                  total_size_bytes = ?, supports_range_requests = ?, status = ?,
                  attempt_count = ?, last_error = ?, last_error_kind = ?, priority = ?,
                  expected_size = ?, expected_sha256 = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(&model.source_url)
        .bind(model.destination_path.to_string_lossy().as_ref())
        .bind(&model.display_name)
        .bind(opt_to_db(id, model.total_size_bytes)?)
        .bind(model.supports_range_requests)
        .bind(model.status.as_str())
        .bind(i64::from(model.attempt_count))
        .bind(model.last_error.as_deref())
        .bind(model.last_error_kind.map(|kind| kind.as_str()))
        .bind(model.priority)
        .bind(opt_to_db(id, model.expected_size)?)
        .bind(model.expected_sha256.as_deref())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        check_affected(id, result.rows_affected())?;

        sqlx::query("DELETE FROM segments WHERE download_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for segment in &model.segments {
            sqlx::query(
                r"INSERT INTO segments
                    (download_id, idx, range_start, range_end, bytes_written, temp_file_path, state)
                  VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(i64::from(segment.index))
            .bind(to_db(id, segment.range_start)?)
            .bind(opt_to_db(id, segment.range_end)?)
            .bind(to_db(id, segment.bytes_written)?)
            .bind(segment.temp_file_path.to_string_lossy().as_ref())
            .bind(segment.state.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads one download with its segments.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails or
    /// [`StoreError::CorruptRecord`] if a row cannot be parsed.
    #[instrument(skip(self))]
    pub async fn load(&self, id: i64) -> Result<Option<DownloadModel>> {
        let Some(row) = sqlx::query_as::<_, DownloadRow>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
        else {
            return Ok(None);
        };

        let segments = sqlx::query_as::<_, SegmentRow>(
            r"SELECT * FROM segments WHERE download_id = ? ORDER BY idx ASC",
        )
        .bind(id)
        .fetch_all(self.db.pool())
        .await?;

        row.into_model(segments).map(Some)
    }

    /// Startup load.
    ///
    /// Downloads found Probing, Active or Merging were interrupted by a crash or
    /// kill; they go back to Queued (and their in-progress segments to Pending)
    /// so they re-enter admission instead of resuming all at once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the reset or the read fails.
    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Result<Vec<DownloadModel>> {
        let mut tx = self.db.pool().begin().await?;

        let reset = sqlx::query(
            r"UPDATE downloads
              SET status = ?, updated_at = datetime('now')
              WHERE status IN (?, ?, ?)",
        )
        .bind(DownloadStatus::Queued.as_str())
        .bind(DownloadStatus::Probing.as_str())
        .bind(DownloadStatus::Active.as_str())
        .bind(DownloadStatus::Merging.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(r"UPDATE segments SET state = ? WHERE state = ?")
            .bind(SegmentState::Pending.as_str())
            .bind(SegmentState::InProgress.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if reset.rows_affected() > 0 {
            info!(
                count = reset.rows_affected(),
                "re-queued downloads interrupted by restart"
            );
        }

        self.list_all().await
    }

    /// Every download, highest priority first, FIFO within a priority.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails or
    /// [`StoreError::CorruptRecord`] if a row cannot be parsed.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<DownloadModel>> {
        let rows = sqlx::query_as::<_, DownloadRow>(
            r"SELECT * FROM downloads ORDER BY priority DESC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let segment_rows = sqlx::query_as::<_, SegmentRow>(
            r"SELECT * FROM segments ORDER BY download_id ASC, idx ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut by_download: HashMap<i64, Vec<SegmentRow>> = HashMap::new();
        for segment in segment_rows {
            by_download
                .entry(segment.download_id)
                .or_default()
                .push(segment);
        }

        rows.into_iter()
            .map(|row| {
                let segments = by_download.remove(&row.id).unwrap_or_default();
                row.into_model(segments)
            })
            .collect()
    }

    /// Deletes a download and its segment rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the download does not exist,
    /// [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM segments WHERE download_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        check_affected(id, result.rows_affected())?;
        tx.commit().await?;
        Ok(())
    }
}
