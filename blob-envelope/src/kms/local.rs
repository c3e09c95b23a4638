use std::{
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    cipher::{self, Key},
    errors::{Error, Result},
    kms::{self, KeyManagementService, KeyPurpose, KeyRef},
};

/// Key files being written carry this prefix; listings skip them.
const STAGING_PREFIX: &str = ".staging-";

/// Directory-backed KMS for single-host use.
///
///  root
///    └── projects/{project}/locations/{location}/keyRings
///        └── {key_ring_id}
///            └── cryptoKeys
///                └── {key_id}.yaml (purpose + hex-encoded KEK)
///
/// Protect the root directory like any other key store.
#[derive(Debug, Clone)]
pub struct Kms {
    root_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct KeyFile {
    purpose: KeyPurpose,
    material: String,
}

impl Kms {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    fn key_rings_dir(&self, project: &str, location: &str) -> Result<PathBuf> {
        check_id("project", project)?;
        check_id("location", location)?;
        Ok(self
            .root_dir
            .join("projects")
            .join(project)
            .join("locations")
            .join(location)
            .join("keyRings"))
    }

    fn key_ring_dir(&self, project: &str, location: &str, key_ring_id: &str) -> Result<PathBuf> {
        check_id("key_ring_id", key_ring_id)?;
        Ok(self.key_rings_dir(project, location)?.join(key_ring_id))
    }

    fn key_file(&self, key_ref: &KeyRef) -> Result<PathBuf> {
        check_id("key_id", &key_ref.key_id)?;
        Ok(self
            .key_ring_dir(&key_ref.project, &key_ref.location, &key_ref.key_ring_id)?
            .join("cryptoKeys")
            .join(format!("{}.yaml", key_ref.key_id)))
    }

    async fn load_key(&self, key_ref: &KeyRef) -> Result<Key> {
        let p = self.key_file(key_ref)?;
        let raw = fs::read(&p).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::API {
                    message: format!("key '{}' not found", key_ref),
                    is_retryable: false,
                }
            } else {
                io_error("read key", &p, e)
            }
        })?;
        let f: KeyFile = serde_yaml::from_slice(&raw).map_err(|e| {
            Error::other(format!("invalid key file {} ({})", p.display(), e))
        })?;
        if f.purpose != KeyPurpose::EncryptDecrypt {
            return Err(Error::API {
                message: format!(
                    "key '{}' has purpose {}, not ENCRYPT_DECRYPT",
                    key_ref,
                    f.purpose.as_str()
                ),
                is_retryable: false,
            });
        }
        let material = hex::decode(f.material.trim()).map_err(|e| {
            Error::other(format!("invalid key material in {} ({})", p.display(), e))
        })?;
        Key::from_slice(&material)
    }
}

#[async_trait]
impl KeyManagementService for Kms {
    async fn list_key_rings(&self, project: &str, location: &str) -> Result<Vec<String>> {
        let dir = self.key_rings_dir(project, location)?;
        list_entries(&dir, |p| p.is_dir(), |name| Some(name.to_string())).await
    }

    async fn create_key_ring(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<()> {
        let parent = self.key_rings_dir(project, location)?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_error("create location", &parent, e))?;

        let dir = self.key_ring_dir(project, location, key_ring_id)?;
        match fs::create_dir(&dir).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists {
                    message: kms::key_ring_path(project, location, key_ring_id),
                });
            }
            Err(e) => return Err(io_error("create key ring", &dir, e)),
        }
        info!(
            "created key ring {} in {}",
            kms::key_ring_path(project, location, key_ring_id),
            dir.display()
        );
        Ok(())
    }

    async fn list_keys(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
    ) -> Result<Vec<String>> {
        let dir = self
            .key_ring_dir(project, location, key_ring_id)?
            .join("cryptoKeys");
        list_entries(
            &dir,
            |p| p.is_file(),
            |name| name.strip_suffix(".yaml").map(String::from),
        )
        .await
    }

    async fn create_key(
        &self,
        project: &str,
        location: &str,
        key_ring_id: &str,
        key_id: &str,
        purpose: KeyPurpose,
    ) -> Result<()> {
        let ring_dir = self.key_ring_dir(project, location, key_ring_id)?;
        if !ring_dir.is_dir() {
            return Err(Error::API {
                message: format!(
                    "key ring '{}' not found",
                    kms::key_ring_path(project, location, key_ring_id)
                ),
                is_retryable: false,
            });
        }
        let keys_dir = ring_dir.join("cryptoKeys");
        fs::create_dir_all(&keys_dir)
            .await
            .map_err(|e| io_error("create keys dir", &keys_dir, e))?;

        let key_ref = KeyRef::new(project, location, key_ring_id, key_id);
        let p = self.key_file(&key_ref)?;

        let material = Key::generate()?;
        let contents = serde_yaml::to_string(&KeyFile {
            purpose,
            material: hex::encode(material.as_bytes()),
        })
        .map_err(|e| Error::other(format!("failed to serialize key file ({})", e)))?;

        // staged next to the final path and published without overwriting,
        // so a key file is either absent or complete
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&keys_dir)
            .map_err(|e| io_error("stage key", &keys_dir, e))?;
        staged
            .write_all(contents.as_bytes())
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| io_error("write key", staged.path(), e))?;
        match staged.persist_noclobber(&p) {
            Ok(_) => {}
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists {
                    message: key_ref.crypto_key_path(),
                });
            }
            Err(e) => return Err(io_error("publish key", &p, e.error)),
        }

        info!("created key {} ({})", key_ref, purpose.as_str());
        Ok(())
    }

    async fn encrypt(&self, key_ref: &KeyRef, plaintext: &[u8]) -> Result<Vec<u8>> {
        let kek = self.load_key(key_ref).await?;
        cipher::encrypt(plaintext, &kek)
    }

    async fn decrypt(&self, key_ref: &KeyRef, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let kek = self.load_key(key_ref).await?;
        cipher::decrypt(ciphertext, &kek).map_err(|e| Error::API {
            message: format!("failed decrypt with '{}' ({})", key_ref, e.message()),
            is_retryable: false,
        })
    }
}

/// Lists directory entry names accepted by "keep", mapped by "name_of".
/// Hidden entries (staged writes) are skipped. A missing directory lists as empty.
async fn list_entries(
    dir: &Path,
    keep: impl Fn(&Path) -> bool,
    name_of: impl Fn(&str) -> Option<String>,
) -> Result<Vec<String>> {
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("read_dir", dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|e| io_error("read_dir", dir, e))?
    {
        let p = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') || !keep(&p) {
            continue;
        }
        match entry.file_name().to_str().and_then(&name_of) {
            Some(n) => names.push(n),
            None => warn!("skipping unexpected entry {}", p.display()),
        }
    }
    names.sort();
    Ok(names)
}

fn check_id(name: &str, v: &str) -> Result<()> {
    if v.is_empty() || v.starts_with('.') || v.contains('/') || v.contains('\\') {
        return Err(Error::other(format!("invalid {} '{}'", name, v)));
    }
    Ok(())
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
fn test_local_kms() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let tmp_dir = tempfile::tempdir().unwrap();
    let kms = Kms::new(tmp_dir.path());

    assert!(ab!(kms.list_key_rings("proj", "europe-west2")).unwrap().is_empty());
    ab!(kms.create_key_ring("proj", "europe-west2", "ring")).unwrap();
    assert!(ab!(kms.create_key_ring("proj", "europe-west2", "ring"))
        .unwrap_err()
        .is_already_exists());
    assert_eq!(
        ab!(kms.list_key_rings("proj", "europe-west2")).unwrap(),
        vec![String::from("ring")]
    );

    assert!(ab!(kms.list_keys("proj", "europe-west2", "ring")).unwrap().is_empty());
    ab!(kms.create_key("proj", "europe-west2", "ring", "key", KeyPurpose::EncryptDecrypt))
        .unwrap();
    assert!(ab!(kms.create_key(
        "proj",
        "europe-west2",
        "ring",
        "key",
        KeyPurpose::EncryptDecrypt
    ))
    .unwrap_err()
    .is_already_exists());
    assert_eq!(
        ab!(kms.list_keys("proj", "europe-west2", "ring")).unwrap(),
        vec![String::from("key")]
    );

    let r = KeyRef::new("proj", "europe-west2", "ring", "key");
    let wrapped = ab!(kms.encrypt(&r, &[9u8; 32])).unwrap();
    assert_eq!(ab!(kms.decrypt(&r, &wrapped)).unwrap(), vec![9u8; 32]);

    // a fresh handle over the same directory sees the same KEK
    let reopened = Kms::new(tmp_dir.path());
    assert_eq!(ab!(reopened.decrypt(&r, &wrapped)).unwrap(), vec![9u8; 32]);

    let missing = KeyRef::new("proj", "europe-west2", "ring", "nope");
    assert!(matches!(
        ab!(kms.encrypt(&missing, b"x")),
        Err(Error::API { .. })
    ));
    assert!(ab!(kms.create_key_ring("proj", "europe-west2", "../escape")).is_err());
}

/// RUST_LOG=debug cargo test --package blob-envelope --lib -- kms::local::test_local_kms_concurrent_ensure --exact --show-output
#[test]
fn test_local_kms_concurrent_ensure() {
    use std::sync::Arc;

    use crate::provisioner::Provisioner;

    let _ = env_logger::builder().is_test(true).try_init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    for round in 0..25 {
        let tmp_dir = tempfile::tempdir().unwrap();
        let kms: Arc<Kms> = Arc::new(Kms::new(tmp_dir.path()));
        let r = KeyRef::new("proj", "europe-west2", "ring", &format!("key-{}", round));

        let results = rt.block_on(async {
            let mut handles = Vec::new();
            for _ in 0..8 {
                let kms = kms.clone();
                let r = r.clone();
                handles.push(tokio::spawn(async move {
                    Provisioner::new(kms.clone()).ensure(&r).await?;
                    kms.encrypt(&r, &[7u8; 32]).await
                }));
            }
            let mut results = Vec::new();
            for h in handles {
                results.push(h.await.unwrap());
            }
            results
        });

        // every caller either created the key or saw a complete one
        for res in results.iter() {
            let wrapped = res.as_ref().unwrap();
            assert_eq!(rt.block_on(kms.decrypt(&r, wrapped)).unwrap(), vec![7u8; 32]);
        }
        assert_eq!(
            rt.block_on(kms.list_keys("proj", "europe-west2", "ring")).unwrap(),
            vec![format!("key-{}", round)]
        );
    }
}
