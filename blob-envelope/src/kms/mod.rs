pub mod aws;
pub mod local;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Identifies a key-encryption key (KEK) held inside the KMS.
/// The key material never leaves the KMS; only wrap/unwrap requests do.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone, Hash)]
#[serde(rename_all = "snake_case")]
pub struct KeyRef {
    pub project: String,
    pub location: String,
    pub key_ring_id: String,
    pub key_id: String,
}

impl KeyRef {
    pub fn new(project: &str, location: &str, key_ring_id: &str, key_id: &str) -> Self {
        Self {
            project: String::from(project),
            location: String::from(location),
            key_ring_id: String::from(key_ring_id),
            key_id: String::from(key_id),
        }
    }

    /// e.g., "projects/p/locations/europe-west2"
    pub fn location_path(&self) -> String {
        location_path(&self.project, &self.location)
    }

    /// e.g., "projects/p/locations/europe-west2/keyRings/ring"
    pub fn key_ring_path(&self) -> String {
        key_ring_path(&self.project, &self.location, &self.key_ring_id)
    }

    /// e.g., "projects/p/locations/europe-west2/keyRings/ring/cryptoKeys/key"
    pub fn crypto_key_path(&self) -> String {
        format!("{}/cryptoKeys/{}", self.key_ring_path(), self.key_id)
    }

    /// Fails if any of the four identifiers is empty.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("project", &self.project),
            ("location", &self.location),
            ("key_ring_id", &self.key_ring_id),
            ("key_id", &self.key_id),
        ] {
            if v.is_empty() {
                return Err(crate::errors::Error::other(format!(
                    "key reference '{}' cannot be empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.crypto_key_path())
    }
}

pub fn location_path(project: &str, location: &str) -> String {
    format!("projects/{}/locations/{}", project, location)
}

pub fn key_ring_path(project: &str, location: &str, key_ring_id: &str) -> String {
    format!("{}/keyRings/{}", location_path(project, location), key_ring_id)
}

/// What a KMS key may be used for.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPurpose {
    /// Symmetric encrypt/decrypt, the only purpose used for wrapping DEKs.
    EncryptDecrypt,
    AsymmetricSign,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &str {
        match self {
            KeyPurpose::EncryptDecrypt => "ENCRYPT_DECRYPT",
            KeyPurpose::AsymmetricSign => "ASYMMETRIC_SIGN",
        }
    }
}

/// Key-management service collaborator.
///
/// "create_*" must fail with "Error::AlreadyExists" when the ring or key is
/// already there, so callers can treat a lost list-then-create race as success.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Returns the key ring ids (not full resource names) in the location.
    async fn list_key_rings(&self, project: &str, location: &str) -> Result<Vec<String>>;

    async fn create_key_ring(&self, project: &str, location: &str, key_ring_id: &str)
        -> Result<()>;

    /// Returns the key ids (not full resource names) in the key ring.
    async fn list_keys(&self, project: &str, location: &str, key_ring_id: &str)
        -> Result<Vec<String>>;

    async fn create_key(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
        key_id: &str,
        purpose: KeyPurpose,
    ) -> Result<()>;

    async fn encrypt(&self, key_ref: &KeyRef, plaintext: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt(&self, key_ref: &KeyRef, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

#[test]
fn test_key_ref_paths() {
    let r = KeyRef::new("proj", "europe-west2", "test_key_ring", "test_key");
    assert_eq!(r.location_path(), "projects/proj/locations/europe-west2");
    assert_eq!(
        r.key_ring_path(),
        "projects/proj/locations/europe-west2/keyRings/test_key_ring"
    );
    assert_eq!(
        r.to_string(),
        "projects/proj/locations/europe-west2/keyRings/test_key_ring/cryptoKeys/test_key"
    );
    assert!(r.validate().is_ok());

    let mut empty = r.clone();
    empty.key_id = String::new();
    assert!(empty.validate().is_err());
}
