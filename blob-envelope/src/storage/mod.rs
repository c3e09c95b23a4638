pub mod local;
pub mod memory;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;

use crate::errors::Result;

/// Object-storage collaborator: flat object names inside named buckets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fails if the bucket does not exist or is not accessible.
    async fn get_bucket(&self, bucket: &str) -> Result<()>;

    /// Uploads the local file as the object, overwriting any existing one.
    async fn put_object_from_file(&self, bucket: &str, key: &str, file_path: &Path)
        -> Result<()>;

    /// Uploads the bytes as the object, overwriting any existing one.
    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;

    /// Downloads the object into the local file.
    /// Fails if the local file already exists.
    async fn get_object_to_file(&self, bucket: &str, key: &str, file_path: &Path)
        -> Result<()>;

    /// Loads the object into memory.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Deletes the object.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Lists object names, sorted, optionally filtered by the name prefix.
    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>>;
}
