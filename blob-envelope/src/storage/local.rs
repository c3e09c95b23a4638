use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;

use crate::{
    errors::{Error, Result},
    humanize,
    storage::ObjectStore,
};

/// Staging directory under the root; writes land here first and are renamed
/// into place, so readers never observe a partially written object.
const STAGING_DIR: &str = ".staging";

/// Directory-backed object store.
/// Each bucket is a directory under the root; object names map to relative paths.
#[derive(Debug, Clone)]
pub struct Store {
    root_dir: PathBuf,
}

impl Store {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Creates the bucket directory. No-op if it already exists.
    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create bucket", &dir, e))?;
        info!("created bucket '{}' at {}", bucket, dir.display());
        Ok(())
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty()
            || bucket.starts_with('.')
            || bucket.contains('/')
            || bucket.contains('\\')
        {
            return Err(Error::other(format!("invalid bucket name '{}'", bucket)));
        }
        Ok(self.root_dir.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let dir = self.bucket_dir(bucket)?;
        if key.is_empty() || key.ends_with('/') {
            return Err(Error::other(format!("invalid object name '{}'", key)));
        }
        let rel = Path::new(key);
        for c in rel.components() {
            match c {
                Component::Normal(_) => {}
                _ => {
                    return Err(Error::other(format!(
                        "object name '{}' must be relative without '.' or '..'",
                        key
                    )))
                }
            }
        }
        Ok(dir.join(rel))
    }

    async fn existing_bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let dir = self.bucket_dir(bucket)?;
        match fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Ok(dir),
            Ok(_) => Err(Error::API {
                message: format!("bucket '{}' is not a directory", bucket),
                is_retryable: false,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::API {
                message: format!("bucket '{}' not found", bucket),
                is_retryable: false,
            }),
            Err(e) => Err(io_error("stat bucket", &dir, e)),
        }
    }

    /// Returns a fresh staging path; the caller fills it and renames it into place.
    async fn staging_path(&self) -> Result<tempfile::TempPath> {
        let dir = self.root_dir.join(STAGING_DIR);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create staging", &dir, e))?;
        let f = tempfile::Builder::new()
            .prefix("put-")
            .tempfile_in(&dir)
            .map_err(|e| io_error("create staging file", &dir, e))?;
        Ok(f.into_temp_path())
    }

    async fn commit(&self, staged: tempfile::TempPath, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create dir", parent, e))?;
        }
        staged
            .persist(dst)
            .map_err(|e| io_error("rename into", dst, e.error))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for Store {
    async fn get_bucket(&self, bucket: &str) -> Result<()> {
        self.existing_bucket_dir(bucket).await?;
        Ok(())
    }

    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<()> {
        self.existing_bucket_dir(bucket).await?;
        let dst = self.object_path(bucket, key)?;

        let staged = self.staging_path().await?;
        let n = fs::copy(file_path, &staged)
            .await
            .map_err(|e| io_error("copy", file_path, e))?;
        self.commit(staged, &dst).await?;

        info!(
            "put '{}' (size {}) to '{}/{}'",
            file_path.display(),
            humanize::bytes(n as usize),
            bucket,
            key
        );
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.existing_bucket_dir(bucket).await?;
        let dst = self.object_path(bucket, key)?;

        let staged = self.staging_path().await?;
        let n = data.len();
        fs::write(&staged, data)
            .await
            .map_err(|e| io_error("write", &staged, e))?;
        self.commit(staged, &dst).await?;

        info!("put {} to '{}/{}'", humanize::bytes(n), bucket, key);
        Ok(())
    }

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
        self.existing_bucket_dir(bucket).await?;
        let src = self.object_path(bucket, key)?;
        let n = fs::copy(&src, file_path)
            .await
            .map_err(|e| not_found_or_io("get object", bucket, key, &src, e))?;
        debug!(
            "downloaded '{}/{}' ({}) to {}",
            bucket,
            key,
            humanize::bytes(n as usize),
            file_path.display()
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.existing_bucket_dir(bucket).await?;
        let src = self.object_path(bucket, key)?;
        fs::read(&src)
            .await
            .map_err(|e| not_found_or_io("get object", bucket, key, &src, e))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let bucket_dir = self.existing_bucket_dir(bucket).await?;
        let p = self.object_path(bucket, key)?;
        match fs::remove_file(&p).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("'{}/{}' already deleted", bucket, key);
                return Ok(());
            }
            Err(e) => return Err(io_error("delete", &p, e)),
        }

        // prune now-empty "directories" so listings stay flat
        let mut dir = p.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == bucket_dir || fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        info!("deleted '{}/{}'", bucket, key);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let bucket_dir = self.existing_bucket_dir(bucket).await?;
        let pfx = prefix.unwrap_or("");

        let mut names = Vec::new();
        let mut pending = vec![bucket_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut rd = fs::read_dir(&dir)
                .await
                .map_err(|e| io_error("read_dir", &dir, e))?;
            while let Some(entry) = rd
                .next_entry()
                .await
                .map_err(|e| io_error("read_dir", &dir, e))?
            {
                let p = entry.path();
                let ft = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("file_type", &p, e))?;
                if ft.is_dir() {
                    pending.push(p);
                    continue;
                }
                let rel = match p.strip_prefix(&bucket_dir) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(pfx) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn not_found_or_io(op: &str, bucket: &str, key: &str, p: &Path, e: io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        return Error::API {
            message: format!("object '{}/{}' not found", bucket, key),
            is_retryable: false,
        };
    }
    io_error(op, p, e)
}

fn io_error(op: &str, p: &Path, e: io::Error) -> Error {
    if e.kind() == ErrorKind::PermissionDenied {
        return Error::Permission {
            message: format!("failed {} {} ({})", op, p.display(), e),
        };
    }
    Error::Other {
        message: format!("failed {} {} ({})", op, p.display(), e),
        is_retryable: false,
    }
}

#[test]
fn test_local_store() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let tmp_dir = tempfile::tempdir().unwrap();
    let store = Store::new(tmp_dir.path());

    assert!(ab!(store.get_bucket("data")).is_err());
    ab!(store.create_bucket("data")).unwrap();
    assert!(ab!(store.get_bucket("data")).is_ok());

    let src = tmp_dir.path().join("upload.csv");
    std::fs::write(&src, b"a,b\n1,2\n").unwrap();
    ab!(store.put_object_from_file("data", "test/upload.csv", &src)).unwrap();
    ab!(store.put_object("data", "test/upload.csv.dek", vec![1, 2, 3])).unwrap();
    ab!(store.put_object("data", "top.txt", b"top".to_vec())).unwrap();

    assert_eq!(
        ab!(store.list_objects("data", None)).unwrap(),
        vec![
            String::from("test/upload.csv"),
            String::from("test/upload.csv.dek"),
            String::from("top.txt"),
        ]
    );
    assert_eq!(
        ab!(store.list_objects("data", Some("test/"))).unwrap().len(),
        2
    );

    let dst = tmp_dir.path().join("downloaded.csv");
    ab!(store.get_object_to_file("data", "test/upload.csv", &dst)).unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), b"a,b\n1,2\n");
    // refuses to clobber a local file
    assert!(ab!(store.get_object_to_file("data", "test/upload.csv", &dst)).is_err());

    assert!(matches!(
        ab!(store.get_object("data", "test/missing")),
        Err(Error::API { .. })
    ));
    assert!(ab!(store.put_object("data", "../escape", vec![0])).is_err());
    assert!(ab!(store.put_object("data", "/abs", vec![0])).is_err());

    ab!(store.delete_object("data", "test/upload.csv")).unwrap();
    ab!(store.delete_object("data", "test/upload.csv.dek")).unwrap();
    ab!(store.delete_object("data", "test/upload.csv.dek")).unwrap();
    assert_eq!(
        ab!(store.list_objects("data", None)).unwrap(),
        vec![String::from("top.txt")]
    );
    assert!(!tmp_dir.path().join("data").join("test").exists());
}
