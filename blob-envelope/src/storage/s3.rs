use std::path::Path;

use async_trait::async_trait;
use aws_config::SdkConfig as AwsSdkConfig;
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::ObjectCannedAcl,
    Client,
};
use log::{debug, info};
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{
    errors::{Error, Result},
    humanize,
    storage::ObjectStore,
};

/// Implements the object-storage collaborator on top of AWS S3.
#[derive(Debug, Clone)]
pub struct Manager {
    cli: Client,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        Self {
            cli: Client::new(shared_config),
        }
    }
}

#[async_trait]
impl ObjectStore for Manager {
    async fn get_bucket(&self, bucket: &str) -> Result<()> {
        self.cli
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| from_sdk_error("head_bucket", e))?;
        debug!("found S3 bucket '{}'", bucket);
        Ok(())
    }

    /// Writes an object to a S3 bucket using stream.
    ///
    /// WARN: use stream! otherwise it can cause OOM -- don't do the following!
    ///       "fs::read" reads all data onto memory
    ///       ".body(ByteStream::from(contents))" passes the whole data to an API call
    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<()> {
        let meta = tokio::fs::metadata(file_path).await.map_err(|e| {
            Error::other(format!(
                "failed metadata {} ({})",
                file_path.display(),
                e
            ))
        })?;
        info!(
            "starting put_object '{}' (size {}) to 's3://{}/{}'",
            file_path.display(),
            humanize::bytes(meta.len() as usize),
            bucket,
            key
        );

        let byte_stream = ByteStream::from_path(file_path)
            .await
            .map_err(|e| Error::other(format!("failed ByteStream::from_path {}", e)))?;
        self.cli
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(byte_stream)
            .acl(ObjectCannedAcl::Private)
            .send()
            .await
            .map_err(|e| from_sdk_error("put_object", e))?;

        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        info!(
            "starting put_object {} to 's3://{}/{}'",
            humanize::bytes(data.len()),
            bucket,
            key
        );
        self.cli
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .acl(ObjectCannedAcl::Private)
            .send()
            .await
            .map_err(|e| from_sdk_error("put_object", e))?;
        Ok(())
    }

    /// Downloads an object from a S3 bucket using stream.
    ///
    /// WARN: use stream! otherwise it can cause OOM -- don't do the following!
    ///       "ByteStream.collect" reads all the data into memory
    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<()> {
        if file_path.exists() {
            return Err(Error::other(format!(
                "file path {} already exists",
                file_path.display()
            )));
        }

        let mut output = self
            .cli
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| from_sdk_error("get_object", e))?;
        info!(
            "starting get_object 's3://{}/{}' (size {})",
            bucket,
            key,
            humanize::bytes(output.content_length().unwrap_or_default() as usize),
        );

        let mut file = File::create(file_path).await.map_err(|e| Error::Other {
            message: format!("failed File::create {}", e),
            is_retryable: false,
        })?;

        debug!("writing byte stream to file {}", file_path.display());
        while let Some(d) = output.body.try_next().await.map_err(|e| Error::Other {
            message: format!("failed ByteStream::try_next {}", e),
            is_retryable: true,
        })? {
            file.write_all(&d).await.map_err(|e| Error::Other {
                message: format!("failed File.write_all {}", e),
                is_retryable: false,
            })?;
        }
        file.flush().await.map_err(|e| Error::Other {
            message: format!("failed File.flush {}", e),
            is_retryable: false,
        })?;

        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .cli
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| from_sdk_error("get_object", e))?;
        let data = output.body.collect().await.map_err(|e| Error::Other {
            message: format!("failed ByteStream::collect {}", e),
            is_retryable: true,
        })?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        info!("deleting 's3://{}/{}'", bucket, key);
        self.cli
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| from_sdk_error("delete_object", e))?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        debug!("listing bucket '{}' with prefix {:?}", bucket, prefix);

        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let resp = self
                .cli
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(String::from))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| from_sdk_error("list_objects_v2", e))?;
            for obj in resp.contents() {
                if let Some(k) = obj.key() {
                    names.push(k.to_string());
                }
            }
            token = match resp.next_continuation_token() {
                Some(t) => Some(t.to_string()),
                None => break,
            };
        }

        names.sort();
        Ok(names)
    }
}

/// Maps an SDK failure onto the crate error taxonomy.
/// HEAD requests carry no error body, so the status code decides for those.
pub fn from_sdk_error<E>(op: &str, e: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let status = e.raw_response().map(|r| r.status().as_u16());
    let message = format!("failed {} {:?}", op, e);
    if matches!(e.code(), Some("AccessDenied") | Some("AllAccessDisabled"))
        || status == Some(403)
    {
        return Error::Permission { message };
    }
    Error::API {
        is_retryable: is_error_retryable(&e),
        message,
    }
}

#[inline]
pub fn is_error_retryable<E>(e: &SdkError<E, HttpResponse>) -> bool
where
    E: ProvideErrorMetadata,
{
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        SdkError::ServiceError(_) => {
            matches!(
                e.code(),
                Some("SlowDown") | Some("InternalError") | Some("ServiceUnavailable")
            ) || matches!(e.raw_response().map(|r| r.status().as_u16()), Some(500..=599))
        }
        _ => false,
    }
}
