use std::collections::BTreeSet;

use async_trait::async_trait;
use aws_config::SdkConfig as AwsSdkConfig;
use aws_sdk_kms::{
    error::{ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{EncryptionAlgorithmSpec, KeySpec, KeyUsageType, Tag},
    Client,
};
use log::{info, warn};

use crate::{
    errors::{Error, Result},
    humanize,
    kms::{KeyManagementService, KeyPurpose, KeyRef},
};

/// Implements the KMS collaborator on top of AWS KMS.
///
/// AWS KMS has no key-ring container, so the hierarchy is expressed with
/// alias names:
///   key ring "r" in project "p" -> alias namespace "alias/p/r/"
///   key "k" in that ring        -> alias "alias/p/r/k" -> symmetric CMK
/// Aliases are regional, so the location is not part of the alias name.
/// Instead it must equal the region the client was configured for; any
/// other location is rejected before a request is sent.
#[derive(Debug, Clone)]
pub struct Manager {
    region: String,
    cli: Client,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        let region = shared_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_default();
        Self {
            region,
            cli: Client::new(shared_config),
        }
    }

    fn check_location(&self, location: &str) -> Result<()> {
        if !self.region.is_empty() && location != self.region {
            return Err(Error::other(format!(
                "KMS location '{}' does not match client region '{}'",
                location, self.region
            )));
        }
        Ok(())
    }

    /// Lists every alias name in the account and region.
    async fn list_alias_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let resp = self
                .cli
                .list_aliases()
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| from_sdk_error("list_aliases", e))?;
            for a in resp.aliases() {
                if let Some(n) = a.alias_name() {
                    names.push(n.to_string());
                }
            }
            marker = resp.next_marker().map(String::from);
            if !resp.truncated() || marker.is_none() {
                break;
            }
        }
        Ok(names)
    }
}

pub fn alias_prefix(project: &str, key_ring_id: &str) -> String {
    format!("alias/{}/{}/", project, key_ring_id)
}

/// Checks an alias against the characters and length AWS KMS accepts, so a
/// bad name fails before a CMK is created for it.
/// ref. https://docs.aws.amazon.com/kms/latest/APIReference/API_CreateAlias.html
pub fn check_alias_name(alias: &str) -> Result<()> {
    let valid = alias.len() <= 256
        && alias.starts_with("alias/")
        && !alias.starts_with("alias/aws/")
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-');
    if !valid {
        return Err(Error::other(format!("invalid KMS alias name '{}'", alias)));
    }
    Ok(())
}

pub fn alias_name(key_ref: &KeyRef) -> String {
    format!(
        "{}{}",
        alias_prefix(&key_ref.project, &key_ref.key_ring_id),
        key_ref.key_id
    )
}

#[async_trait]
impl KeyManagementService for Manager {
    async fn list_key_rings(&self, project: &str, location: &str) -> Result<Vec<String>> {
        self.check_location(location)?;
        let pfx = format!("alias/{}/", project);
        let rings: BTreeSet<String> = self
            .list_alias_names()
            .await?
            .iter()
            .filter_map(|n| n.strip_prefix(&pfx))
            .filter_map(|rest| rest.split_once('/'))
            .map(|(ring, _)| ring.to_string())
            .collect();
        Ok(rings.into_iter().collect())
    }

    async fn create_key_ring(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<()> {
        self.check_location(location)?;
        // nothing to create remotely; the ring shows up with its first key alias
        info!(
            "key ring '{}' maps to alias namespace '{}'",
            key_ring_id,
            alias_prefix(project, key_ring_id)
        );
        Ok(())
    }

    async fn list_keys(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<Vec<String>> {
        self.check_location(location)?;
        let pfx = alias_prefix(project, key_ring_id);
        let mut keys: Vec<String> = self
            .list_alias_names()
            .await?
            .iter()
            .filter_map(|n| n.strip_prefix(&pfx))
            .filter(|k| !k.is_empty() && !k.contains('/'))
            .map(String::from)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn create_key(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
        key_id: &str,
        purpose: KeyPurpose,
    ) -> Result<()> {
        self.check_location(location)?;
        if purpose != KeyPurpose::EncryptDecrypt {
            return Err(Error::other(format!(
                "unsupported key purpose {} for envelope keys",
                purpose.as_str()
            )));
        }

        let key_ref = KeyRef::new(project, location, key_ring_id, key_id);
        let alias = alias_name(&key_ref);
        check_alias_name(&alias)?;
        info!("creating KMS CMK for '{}'", alias);

        let name_tag = Tag::builder()
            .tag_key("Name")
            .tag_value(&alias)
            .build()
            .map_err(|e| Error::other(format!("failed to build tag ({})", e)))?;
        let resp = self
            .cli
            .create_key()
            .description(key_ref.crypto_key_path())
            .key_usage(KeyUsageType::EncryptDecrypt)
            .key_spec(KeySpec::SymmetricDefault)
            .tags(name_tag)
            .send()
            .await
            .map_err(|e| from_sdk_error("create_key", e))?;
        let key_id_created = match resp.key_metadata() {
            Some(meta) => meta.key_id().to_string(),
            None => {
                return Err(Error::API {
                    message: String::from("unexpected empty key metadata"),
                    is_retryable: false,
                });
            }
        };

        let ret = self
            .cli
            .create_alias()
            .alias_name(&alias)
            .target_key_id(&key_id_created)
            .send()
            .await;
        if let Err(e) = ret {
            // the CMK we just made is unreferenced whichever way the alias failed
            let err = from_sdk_error("create_alias", e);
            warn!(
                "failed to create alias '{}' ({}); scheduling unused CMK '{}' for deletion",
                alias,
                err.message(),
                key_id_created
            );
            if let Err(e) = self.schedule_to_delete(&key_id_created).await {
                warn!(
                    "failed to schedule unused CMK '{}' for deletion ({})",
                    key_id_created,
                    e.message()
                );
            }
            return Err(err);
        }

        info!("created KMS CMK '{}' with alias '{}'", key_id_created, alias);
        Ok(())
    }

    /// Encrypts data. The maximum size of the data KMS can encrypt is 4096 bytes for
    /// "SYMMETRIC_DEFAULT" encryption algorithm, plenty for a DEK.
    /// ref. https://docs.aws.amazon.com/kms/latest/APIReference/API_Encrypt.html
    async fn encrypt(&self, key_ref: &KeyRef, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_location(&key_ref.location)?;
        info!(
            "encrypting data (plaintext size {})",
            humanize::bytes(plaintext.len())
        );
        let resp = self
            .cli
            .encrypt()
            .key_id(alias_name(key_ref))
            .plaintext(Blob::new(plaintext))
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .send()
            .await
            .map_err(|e| from_sdk_error("encrypt", e))?;

        let ciphertext = match resp.ciphertext_blob() {
            Some(v) => v.as_ref().to_vec(),
            None => {
                return Err(Error::API {
                    message: String::from("EncryptOutput.ciphertext_blob not found"),
                    is_retryable: false,
                });
            }
        };
        info!(
            "encrypted data (ciphertext size {})",
            humanize::bytes(ciphertext.len())
        );
        Ok(ciphertext)
    }

    /// Decrypts data.
    /// The maximum length of "ciphertext" is 6144 bytes.
    /// ref. https://docs.aws.amazon.com/kms/latest/APIReference/API_Decrypt.html
    async fn decrypt(&self, key_ref: &KeyRef, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_location(&key_ref.location)?;
        info!(
            "decrypting data (ciphertext size {})",
            humanize::bytes(ciphertext.len())
        );
        let resp = self
            .cli
            .decrypt()
            .key_id(alias_name(key_ref))
            .ciphertext_blob(Blob::new(ciphertext))
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .send()
            .await
            .map_err(|e| from_sdk_error("decrypt", e))?;

        let plaintext = match resp.plaintext() {
            Some(v) => v.as_ref().to_vec(),
            None => {
                return Err(Error::API {
                    message: String::from("DecryptOutput.plaintext not found"),
                    is_retryable: false,
                });
            }
        };
        Ok(plaintext)
    }
}

impl Manager {
    /// Schedules to delete a KMS CMK.
    pub async fn schedule_to_delete(&self, key_id: &str) -> Result<()> {
        info!("deleting KMS CMK '{}'", key_id);
        let ret = self
            .cli
            .schedule_key_deletion()
            .key_id(key_id)
            .pending_window_in_days(7)
            .send()
            .await;
        match ret {
            Ok(_) => info!("scheduled to delete KMS CMK '{}'", key_id),
            Err(e) => {
                if e.code() == Some("NotFoundException") {
                    warn!("KMS CMK '{}' does not exist", key_id);
                    return Ok(());
                }
                return Err(from_sdk_error("schedule_key_deletion", e));
            }
        }
        Ok(())
    }
}

/// Maps an SDK failure onto the crate error taxonomy.
pub fn from_sdk_error<E, R>(op: &str, e: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let message = format!("failed {} {:?}", op, e);
    match e.code() {
        Some("AlreadyExistsException") => return Error::AlreadyExists { message },
        Some("AccessDeniedException") | Some("UnrecognizedClientException") => {
            return Error::Permission { message }
        }
        _ => {}
    }
    Error::API {
        is_retryable: is_error_retryable(&e),
        message,
    }
}

#[inline]
pub fn is_error_retryable<E, R>(e: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        SdkError::ServiceError(_) => matches!(
            e.code(),
            Some("DependencyTimeoutException")
                | Some("KMSInternalException")
                | Some("KeyUnavailableException")
                | Some("ThrottlingException")
        ),
        _ => false,
    }
}

#[test]
fn test_alias_names() {
    let r = KeyRef::new("proj", "us-west-2", "ring", "key");
    assert_eq!(alias_prefix("proj", "ring"), "alias/proj/ring/");
    assert_eq!(alias_name(&r), "alias/proj/ring/key");
}

#[test]
fn test_check_alias_name() {
    assert!(check_alias_name("alias/proj/ring/key").is_ok());
    assert!(check_alias_name("alias/test-project/test_key_ring/test_key").is_ok());

    assert!(check_alias_name("alias/proj/ring/test.key").is_err());
    assert!(check_alias_name("alias/proj/ring/key name").is_err());
    assert!(check_alias_name("alias/aws/ring/key").is_err());
    assert!(check_alias_name("proj/ring/key").is_err());
    assert!(check_alias_name(&format!("alias/proj/ring/{}", "k".repeat(256))).is_err());

    let r = KeyRef::new("proj", "us-west-2", "ring", "upload.key");
    assert!(check_alias_name(&alias_name(&r)).is_err());
}

#[test]
fn test_check_location() {
    use aws_config::{BehaviorVersion, Region};

    let shared_config = AwsSdkConfig::builder()
        .region(Region::new("us-west-2"))
        .behavior_version(BehaviorVersion::latest())
        .build();
    let manager = Manager::new(&shared_config);

    assert!(manager.check_location("us-west-2").is_ok());
    let err = manager.check_location("eu-west-2").unwrap_err();
    assert!(err.message().contains("eu-west-2"));
    assert!(!err.is_retryable());
}
