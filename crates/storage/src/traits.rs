//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Object store abstraction for export archives.
///
/// Keys are `/`-separated relative paths such as `exposures/ie/1615377600000.zip`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's full contents.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Returns `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List keys under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Check that the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()> {
        self.list("").await?;
        Ok(())
    }
}

/// Content type to advertise for an object key.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext) {
        Some("zip") => "application/zip",
        Some("bin") | Some("sig") => "application/octet-stream",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_are_served_as_zip() {
        assert_eq!(content_type_for("exposures/ie/1.zip"), "application/zip");
        assert_eq!(content_type_for("export.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
