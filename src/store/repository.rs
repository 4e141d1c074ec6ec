//! Repository seam between the coordinator and durable storage.

use async_trait::async_trait;

use super::{Result, Store};
use crate::model::{DownloadModel, NewDownload};

/// Data-access contract the coordinator depends on.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// Inserts a new Queued download and returns it with its assigned id.
    async fn create(&self, new: &NewDownload) -> Result<DownloadModel>;

    /// Persists the model and its segments in one transaction.
    async fn save(&self, model: &DownloadModel) -> Result<()>;

    /// Loads one model.
    async fn load(&self, id: i64) -> Result<Option<DownloadModel>>;

    /// Startup load: interrupted models are reset to Queued first.
    async fn load_all(&self) -> Result<Vec<DownloadModel>>;

    /// Every model in admission order, without modification.
    async fn list_all(&self) -> Result<Vec<DownloadModel>>;

    /// Removes a model and its segments.
    async fn delete(&self, id: i64) -> Result<()>;
}

#[async_trait]
impl DownloadRepository for Store {
    async fn create(&self, new: &NewDownload) -> Result<DownloadModel> {
        Store::create(self, new).await
    }

    async fn save(&self, model: &DownloadModel) -> Result<()> {
        Store::save(self, model).await
    }

    async fn load(&self, id: i64) -> Result<Option<DownloadModel>> {
        Store::load(self, id).await
    }

    async fn load_all(&self) -> Result<Vec<DownloadModel>> {
        Store::load_all(self).await
    }

    async fn list_all(&self) -> Result<Vec<DownloadModel>> {
        Store::list_all(self).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        Store::delete(self, id).await
    }
}
