use std::sync::Arc;

use log::debug;
use zeroize::Zeroizing;

use crate::{
    errors::Result,
    kms::{KeyManagementService, KeyRef},
};

/// Wraps and unwraps data-encryption keys under a KMS-held key-encryption key.
///
/// Unwrap failures come back as the KMS reported them (API or permission
/// errors). They are never turned into cipher errors: a KMS rejection says
/// nothing about whether the file ciphertext was tampered with.
#[derive(Clone)]
pub struct KeyWrapper {
    kms: Arc<dyn KeyManagementService>,
}

impl KeyWrapper {
    pub fn new(kms: Arc<dyn KeyManagementService>) -> Self {
        Self { kms }
    }

    pub async fn wrap(&self, key_ref: &KeyRef, dek: &[u8]) -> Result<Vec<u8>> {
        debug!("wrapping DEK with '{}'", key_ref);
        self.kms.encrypt(key_ref, dek).await
    }

    /// The returned bytes are wiped when dropped.
    pub async fn unwrap(&self, key_ref: &KeyRef, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        debug!("unwrapping DEK with '{}'", key_ref);
        let dek = self.kms.decrypt(key_ref, wrapped).await?;
        Ok(Zeroizing::new(dek))
    }
}

#[test]
fn test_wrap_unwrap() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let fake = Arc::new(crate::kms::memory::Kms::new());
    let provisioner = crate::provisioner::Provisioner::new(fake.clone());
    let wrapper = KeyWrapper::new(fake.clone());

    let r = KeyRef::new("proj", "europe-west2", "ring", "key");
    ab!(provisioner.ensure(&r)).unwrap();

    let dek = crate::cipher::generate_key().unwrap();
    let wrapped = ab!(wrapper.wrap(&r, dek.as_bytes())).unwrap();
    assert_ne!(wrapped.as_slice(), dek.as_bytes());
    let unwrapped = ab!(wrapper.unwrap(&r, &wrapped)).unwrap();
    assert_eq!(unwrapped.as_slice(), dek.as_bytes());

    // another KEK cannot open it, and the failure is a KMS error
    let other = KeyRef::new("proj", "europe-west2", "ring", "other");
    ab!(provisioner.ensure(&other)).unwrap();
    let err = ab!(wrapper.unwrap(&other, &wrapped)).unwrap_err();
    assert!(matches!(err, crate::errors::Error::API { .. }));
    assert!(err.crypto_kind().is_none());

    fake.set_denied(true);
    assert!(ab!(wrapper.wrap(&r, dek.as_bytes()))
        .unwrap_err()
        .is_permission());
}
