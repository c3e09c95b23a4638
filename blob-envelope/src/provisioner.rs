use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
    errors::Result,
    kms::{self, KeyManagementService, KeyPurpose, KeyRef},
};

/// Makes sure a key ring and a key exist before they are used.
///
/// Lists first and creates only what is missing. A create that loses the
/// race against another writer ("already exists") counts as success.
/// Permission and remote failures are returned as they are; nothing is retried.
#[derive(Clone)]
pub struct Provisioner {
    kms: Arc<dyn KeyManagementService>,
}

impl Provisioner {
    pub fn new(kms: Arc<dyn KeyManagementService>) -> Self {
        Self { kms }
    }

    pub async fn ensure_key_ring(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<()> {
        let path = kms::key_ring_path(project, location, key_ring_id);

        let rings = self.kms.list_key_rings(project, location).await?;
        if rings.iter().any(|r| r == key_ring_id) {
            debug!("key ring '{}' already exists", path);
            return Ok(());
        }

        info!("creating key ring '{}'", path);
        match self
            .kms
            .create_key_ring(project, location, key_ring_id)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                warn!("key ring '{}' created concurrently ({})", path, e.message());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Requires the key ring to exist.
    pub async fn ensure_key(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
        key_id: &str,
    ) -> Result<()> {
        let key_ref = KeyRef::new(project, location, key_ring_id, key_id);

        let keys = self.kms.list_keys(project, location, key_ring_id).await?;
        if keys.iter().any(|k| k == key_id) {
            debug!("key '{}' already exists", key_ref);
            return Ok(());
        }

        info!("creating key '{}'", key_ref);
        match self
            .kms
            .create_key(
                project,
                location,
                key_ring_id,
                key_id,
                KeyPurpose::EncryptDecrypt,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                warn!("key '{}' created concurrently ({})", key_ref, e.message());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Ensures the ring, then the key.
    pub async fn ensure(&self, key_ref: &KeyRef) -> Result<()> {
        key_ref.validate()?;
        self.ensure_key_ring(&key_ref.project, &key_ref.location, &key_ref.key_ring_id)
            .await?;
        self.ensure_key(
            &key_ref.project,
            &key_ref.location,
            &key_ref.key_ring_id,
            &key_ref.key_id,
        )
        .await
    }
}

#[cfg(test)]
macro_rules! ab {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

/// RUST_LOG=debug cargo test --package blob-envelope --lib -- provisioner::test_ensure_idempotent --exact --show-output
#[test]
fn test_ensure_idempotent() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fake = Arc::new(kms::memory::Kms::new());
    let p = Provisioner::new(fake.clone());
    let r = KeyRef::new("test-project", "europe-west2", "test_key_ring", "test_key");

    ab!(p.ensure(&r)).unwrap();
    ab!(p.ensure(&r)).unwrap();

    assert_eq!(fake.key_ring_count("test-project", "europe-west2"), 1);
    assert_eq!(
        fake.key_count("test-project", "europe-west2", "test_key_ring"),
        1
    );
    let calls = fake.calls();
    assert_eq!(calls.create_key_ring, 1);
    assert_eq!(calls.create_key, 1);
    assert_eq!(calls.list_key_rings, 2);
    assert_eq!(calls.list_keys, 2);
}

#[test]
fn test_ensure_tolerates_create_race() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fake = Arc::new(kms::memory::Kms::new());
    let p = Provisioner::new(fake.clone());
    let r = KeyRef::new("proj", "us-west-2", "ring", "key");
    ab!(p.ensure(&r)).unwrap();

    // listings miss the resources, so both creates hit "already exists"
    fake.set_listing_lags(true);
    ab!(p.ensure(&r)).unwrap();

    assert_eq!(fake.key_ring_count("proj", "us-west-2"), 1);
    assert_eq!(fake.key_count("proj", "us-west-2", "ring"), 1);
    assert_eq!(fake.calls().create_key_ring, 2);
    assert_eq!(fake.calls().create_key, 2);
}

#[test]
fn test_ensure_surfaces_failures_without_retry() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fake = Arc::new(kms::memory::Kms::new());
    let p = Provisioner::new(fake.clone());
    let r = KeyRef::new("proj", "us-west-2", "ring", "key");

    fake.set_denied(true);
    let err = ab!(p.ensure(&r)).unwrap_err();
    assert!(err.is_permission());
    assert_eq!(fake.calls().list_key_rings, 1);
    assert_eq!(fake.calls().create_key_ring, 0);
    fake.set_denied(false);

    fake.set_unavailable(true);
    let err = ab!(p.ensure_key_ring("proj", "us-west-2", "ring")).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(fake.calls().list_key_rings, 2);
    assert_eq!(fake.calls().create_key_ring, 0);
    fake.set_unavailable(false);

    // a key cannot be made before its ring
    assert!(ab!(p.ensure_key("proj", "us-west-2", "ring", "key")).is_err());
    assert_eq!(fake.key_ring_count("proj", "us-west-2"), 0);
}
