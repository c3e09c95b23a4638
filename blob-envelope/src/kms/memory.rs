use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;

use crate::{
    cipher::{self, Key},
    errors::{Error, Result},
    kms::{self, KeyManagementService, KeyPurpose, KeyRef},
};

/// In-process KMS used in tests and dry runs.
/// KEKs are random per key and never exposed.
#[derive(Default)]
pub struct Kms {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// location path -> key ring ids
    rings: BTreeMap<String, BTreeSet<String>>,
    /// key ring path -> key id -> key
    keys: BTreeMap<String, BTreeMap<String, Entry>>,

    denied: bool,
    unavailable: bool,
    listing_lags: bool,

    calls: Calls,
}

struct Entry {
    purpose: KeyPurpose,
    material: Key,
}

/// Number of API calls served, per method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub list_key_rings: usize,
    pub create_key_ring: usize,
    pub list_keys: usize,
    pub create_key: usize,
    pub encrypt: usize,
    pub decrypt: usize,
}

impl Kms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with "Error::Permission" while set.
    pub fn set_denied(&self, denied: bool) {
        self.state.lock().denied = denied;
    }

    /// Every call fails with a retryable "Error::API" while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Listings return nothing while set, as if another writer created the
    /// resources after our list call (the list-then-create race).
    pub fn set_listing_lags(&self, lags: bool) {
        self.state.lock().listing_lags = lags;
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls
    }

    /// Number of key rings that exist in the location, regardless of listing lag.
    pub fn key_ring_count(&self, project: &str, location: &str) -> usize {
        let state = self.state.lock();
        state
            .rings
            .get(&kms::location_path(project, location))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Number of keys that exist in the ring, regardless of listing lag.
    pub fn key_count(&self, project: &str, location: &str, key_ring_id: &str) -> usize {
        let state = self.state.lock();
        state
            .keys
            .get(&kms::key_ring_path(project, location, key_ring_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl State {
    fn check_access(&self, op: &str) -> Result<()> {
        if self.denied {
            return Err(Error::Permission {
                message: format!("caller lacks permission for {}", op),
            });
        }
        if self.unavailable {
            return Err(Error::API {
                message: format!("failed {} (service unavailable)", op),
                is_retryable: true,
            });
        }
        Ok(())
    }

    fn key(&self, key_ref: &KeyRef) -> Result<&Entry> {
        let entry = self
            .keys
            .get(&key_ref.key_ring_path())
            .and_then(|m| m.get(&key_ref.key_id))
            .ok_or_else(|| Error::API {
                message: format!("key '{}' not found", key_ref),
                is_retryable: false,
            })?;
        if entry.purpose != KeyPurpose::EncryptDecrypt {
            return Err(Error::API {
                message: format!(
                    "key '{}' has purpose {}, not ENCRYPT_DECRYPT",
                    key_ref,
                    entry.purpose.as_str()
                ),
                is_retryable: false,
            });
        }
        Ok(entry)
    }
}

#[async_trait]
impl KeyManagementService for Kms {
    async fn list_key_rings(&self, project: &str, location: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.calls.list_key_rings += 1;
        state.check_access("list_key_rings")?;
        if state.listing_lags {
            return Ok(Vec::new());
        }
        Ok(state
            .rings
            .get(&kms::location_path(project, location))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_key_ring(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.create_key_ring += 1;
        state.check_access("create_key_ring")?;

        let rings = state
            .rings
            .entry(kms::location_path(project, location))
            .or_default();
        if !rings.insert(key_ring_id.to_string()) {
            return Err(Error::AlreadyExists {
                message: kms::key_ring_path(project, location, key_ring_id),
            });
        }
        info!(
            "created key ring {}",
            kms::key_ring_path(project, location, key_ring_id)
        );
        Ok(())
    }

    async fn list_keys(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.calls.list_keys += 1;
        state.check_access("list_keys")?;
        if state.listing_lags {
            return Ok(Vec::new());
        }
        Ok(state
            .keys
            .get(&kms::key_ring_path(project, location, key_ring_id))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_key(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
        key_id: &str,
        purpose: KeyPurpose,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.create_key += 1;
        state.check_access("create_key")?;

        let ring_exists = state
            .rings
            .get(&kms::location_path(project, location))
            .map(|s| s.contains(key_ring_id))
            .unwrap_or(false);
        let ring_path = kms::key_ring_path(project, location, key_ring_id);
        if !ring_exists {
            return Err(Error::API {
                message: format!("key ring '{}' not found", ring_path),
                is_retryable: false,
            });
        }

        let keys = state.keys.entry(ring_path.clone()).or_default();
        if keys.contains_key(key_id) {
            return Err(Error::AlreadyExists {
                message: format!("{}/cryptoKeys/{}", ring_path, key_id),
            });
        }
        let material = Key::generate()?;
        keys.insert(key_id.to_string(), Entry { purpose, material });
        info!("created key {}/cryptoKeys/{}", ring_path, key_id);
        Ok(())
    }

    async fn encrypt(&self, key_ref: &KeyRef, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.calls.encrypt += 1;
        state.check_access("encrypt")?;
        let entry = state.key(key_ref)?;
        cipher::encrypt(plaintext, &entry.material)
    }

    async fn decrypt(&self, key_ref: &KeyRef, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.calls.decrypt += 1;
        state.check_access("decrypt")?;
        let entry = state.key(key_ref)?;

        // the service reports a bad ciphertext as a request error, not a cipher error
        cipher::decrypt(ciphertext, &entry.material).map_err(|e| Error::API {
            message: format!("failed decrypt with '{}' ({})", key_ref, e.message()),
            is_retryable: false,
        })
    }
}

#[test]
fn test_memory_kms() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let kms = Kms::new();
    let r = KeyRef::new("p", "europe-west2", "ring", "key");

    // key cannot be created before its ring
    let ret = ab!(kms.create_key("p", "europe-west2", "ring", "key", KeyPurpose::EncryptDecrypt));
    assert!(matches!(ret, Err(Error::API { .. })));

    ab!(kms.create_key_ring("p", "europe-west2", "ring")).unwrap();
    let ret = ab!(kms.create_key_ring("p", "europe-west2", "ring"));
    assert!(ret.unwrap_err().is_already_exists());
    assert_eq!(
        ab!(kms.list_key_rings("p", "europe-west2")).unwrap(),
        vec![String::from("ring")]
    );
    assert!(ab!(kms.list_key_rings("p", "us-east1")).unwrap().is_empty());

    ab!(kms.create_key("p", "europe-west2", "ring", "key", KeyPurpose::EncryptDecrypt)).unwrap();
    let ret = ab!(kms.create_key("p", "europe-west2", "ring", "key", KeyPurpose::EncryptDecrypt));
    assert!(ret.unwrap_err().is_already_exists());

    let wrapped = ab!(kms.encrypt(&r, b"0123456789abcdef0123456789abcdef")).unwrap();
    let unwrapped = ab!(kms.decrypt(&r, &wrapped)).unwrap();
    assert_eq!(unwrapped, b"0123456789abcdef0123456789abcdef");

    // signing keys cannot wrap
    ab!(kms.create_key("p", "europe-west2", "ring", "signer", KeyPurpose::AsymmetricSign)).unwrap();
    let signer = KeyRef::new("p", "europe-west2", "ring", "signer");
    assert!(ab!(kms.encrypt(&signer, b"x")).is_err());

    kms.set_denied(true);
    assert!(ab!(kms.decrypt(&r, &wrapped)).unwrap_err().is_permission());
    kms.set_denied(false);

    kms.set_unavailable(true);
    assert!(ab!(kms.encrypt(&r, b"x")).unwrap_err().is_retryable());
    kms.set_unavailable(false);

    let calls = kms.calls();
    assert_eq!(calls.create_key_ring, 2);
    assert_eq!(calls.create_key, 4);
}
