use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;

use crate::{
    errors::{Error, Result},
    storage::ObjectStore,
};

/// In-process object store for tests.
#[derive(Default)]
pub struct Store {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    failing_put_suffixes: BTreeSet<String>,
    failing_delete_suffixes: BTreeSet<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a store with the named buckets already created.
    pub fn with_buckets(names: &[&str]) -> Self {
        let s = Self::new();
        for n in names {
            s.create_bucket(n);
        }
        s
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Puts of objects whose name ends with the suffix fail with a retryable API error.
    pub fn fail_puts_with_suffix(&self, suffix: &str) {
        self.state
            .lock()
            .failing_put_suffixes
            .insert(suffix.to_string());
    }

    /// Deletes of objects whose name ends with the suffix fail with a retryable API error.
    pub fn fail_deletes_with_suffix(&self, suffix: &str) {
        self.state
            .lock()
            .failing_delete_suffixes
            .insert(suffix.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_put_suffixes.clear();
        state.failing_delete_suffixes.clear();
    }

    /// Returns a copy of the object contents, if present.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
    }

    /// Returns all object names in the bucket.
    pub fn names(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl State {
    fn bucket_mut(&mut self, bucket: &str) -> Result<&mut BTreeMap<String, Vec<u8>>> {
        self.buckets.get_mut(bucket).ok_or_else(|| Error::API {
            message: format!("bucket '{}' not found", bucket),
            is_retryable: false,
        })
    }

    fn put(&mut self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        if self.failing_put_suffixes.iter().any(|s| key.ends_with(s)) {
            return Err(Error::API {
                message: format!("failed put_object '{}' (injected)", key),
                is_retryable: true,
            });
        }
        debug!("put {}/{} ({} bytes)", bucket, key, data.len());
        self.bucket_mut(bucket)?.insert(key.to_string(), data);
        Ok(())
    }

    fn get(&mut self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.bucket_mut(bucket)?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::API {
                message: format!("object '{}/{}' not found", bucket, key),
                is_retryable: false,
            })
    }
}

#[async_trait]
impl ObjectStore for Store {
    async fn get_bucket(&self, bucket: &str) -> Result<()> {
        self.state.lock().bucket_mut(bucket)?;
        Ok(())
    }

    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<()> {
        let data = tokio::fs::read(file_path).await.map_err(|e| {
            Error::other(format!("failed read {} ({})", file_path.display(), e))
        })?;
        self.state.lock().put(bucket, key, data)
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.state.lock().put(bucket, key, data)
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
        let data = self.state.lock().get(bucket, key)?;
        tokio::fs::write(file_path, data).await.map_err(|e| {
            Error::other(format!("failed write {} ({})", file_path.display(), e))
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.state.lock().get(bucket, key)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_delete_suffixes.iter().any(|s| key.ends_with(s)) {
            return Err(Error::API {
                message: format!("failed delete_object '{}' (injected)", key),
                is_retryable: true,
            });
        }
        state.bucket_mut(bucket)?.remove(key);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let pfx = prefix.unwrap_or("");
        Ok(state
            .bucket_mut(bucket)?
            .keys()
            .filter(|k| k.starts_with(pfx))
            .cloned()
            .collect())
    }
}

#[test]
fn test_memory_store() {
    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let store = Store::with_buckets(&["b"]);
    assert!(ab!(store.get_bucket("b")).is_ok());
    assert!(ab!(store.get_bucket("missing")).is_err());

    ab!(store.put_object("b", "dir/a.txt", b"a".to_vec())).unwrap();
    ab!(store.put_object("b", "dir/b.txt", b"b".to_vec())).unwrap();
    ab!(store.put_object("b", "other.txt", b"o".to_vec())).unwrap();
    assert_eq!(
        ab!(store.list_objects("b", Some("dir/"))).unwrap(),
        vec![String::from("dir/a.txt"), String::from("dir/b.txt")]
    );
    assert_eq!(ab!(store.get_object("b", "dir/a.txt")).unwrap(), b"a");
    assert!(ab!(store.get_object("b", "dir/zzz")).is_err());

    store.fail_puts_with_suffix(".dek");
    assert!(ab!(store.put_object("b", "x.dek", vec![1])).unwrap_err().is_retryable());
    store.clear_failures();

    ab!(store.delete_object("b", "dir/a.txt")).unwrap();
    assert!(store.object("b", "dir/a.txt").is_none());
    assert_eq!(store.names("b").len(), 2);
}
