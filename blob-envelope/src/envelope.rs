use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};
use tempfile::TempDir;

use crate::{
    artifacts::{self, Orphan},
    cipher::{self, Key},
    errors::{Error, Result},
    humanize,
    kms::{KeyManagementService, KeyRef},
    provisioner::Provisioner,
    storage::ObjectStore,
    wrapper::KeyWrapper,
};

/// Implements envelope encryption of local files into object storage.
///
/// Each protected file gets a fresh 32-byte data-encryption key (DEK). The
/// file is sealed with the DEK locally, the DEK is wrapped by the KMS, and two
/// objects are stored side by side:
///   "name.encrypted" (file ciphertext)
///   "name.dek"       (wrapped DEK bytes, no metadata)
/// The key reference is never stored; callers pass it again at decrypt time.
///
/// A failed step aborts the remaining steps. Nothing is rolled back; use
/// "find_orphans" to report half-written pairs.
#[derive(Clone)]
pub struct Manager {
    store: Arc<dyn ObjectStore>,
    provisioner: Provisioner,
    wrapper: KeyWrapper,
    temp_root: Option<PathBuf>,
}

impl Manager {
    pub fn new(store: Arc<dyn ObjectStore>, kms: Arc<dyn KeyManagementService>) -> Self {
        Self {
            store,
            provisioner: Provisioner::new(kms.clone()),
            wrapper: KeyWrapper::new(kms),
            temp_root: None,
        }
    }

    /// Creates the per-call scratch directories under "dir" instead of the
    /// system temp directory.
    pub fn with_temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }

    /// Uploads the local file as is.
    pub async fn upload_plain(
        &self,
        bucket: &str,
        source_path: &Path,
        destination_name: &str,
    ) -> Result<()> {
        self.store.get_bucket(bucket).await?;
        check_source(source_path).await?;

        info!(
            "uploading '{}' to '{}/{}'",
            source_path.display(),
            bucket,
            destination_name
        );
        self.store
            .put_object_from_file(bucket, destination_name, source_path)
            .await?;
        info!("uploaded '{}/{}'", bucket, destination_name);
        Ok(())
    }

    /// Envelope-encrypts the local file and uploads
    /// "destination_name.encrypted" then "destination_name.dek".
    /// Provisions the key ring and the key on first use.
    pub async fn encrypt_and_upload(
        &self,
        bucket: &str,
        source_path: &Path,
        destination_name: &str,
        key_ref: &KeyRef,
    ) -> Result<()> {
        self.store.get_bucket(bucket).await?;
        key_ref.validate()?;
        let plaintext = check_source(source_path).await?;
        info!(
            "envelope-encrypting '{}' (size {}) with '{}'",
            source_path.display(),
            humanize::bytes(plaintext.len()),
            key_ref
        );

        let dek = cipher::generate_key()?;
        let ciphertext = cipher::encrypt(&plaintext, &dek)?;
        drop(plaintext);

        self.provisioner.ensure(key_ref).await?;
        let wrapped = self.wrapper.wrap(key_ref, dek.as_bytes()).await?;
        drop(dek);

        let encrypted_blob = artifacts::encrypted_name(destination_name);
        let dek_blob = artifacts::dek_name(destination_name);
        info!(
            "uploading '{}/{}' (size {})",
            bucket,
            encrypted_blob,
            humanize::bytes(ciphertext.len())
        );
        self.store
            .put_object(bucket, &encrypted_blob, ciphertext)
            .await?;
        self.store.put_object(bucket, &dek_blob, wrapped).await?;

        info!(
            "uploaded '{}/{}' and '{}/{}'",
            bucket, encrypted_blob, bucket, dek_blob
        );
        Ok(())
    }

    /// Restores "name" from "name.encrypted" and "name.dek", then deletes both.
    /// Returns the restored object name.
    ///
    /// The remote pair is deleted only after the plaintext upload succeeded
    /// and the local scratch copy was removed.
    /// A ciphertext that does not open under the unwrapped DEK fails with
    /// "Error::DecryptionFailed" and leaves both remote objects in place.
    pub async fn download_and_decrypt(
        &self,
        bucket: &str,
        encrypted_blob: &str,
        key_ref: &KeyRef,
    ) -> Result<String> {
        let restored = artifacts::restored_name(encrypted_blob)?;
        let dek_blob = artifacts::dek_name_for_encrypted(encrypted_blob)?;
        key_ref.validate()?;
        self.store.get_bucket(bucket).await?;

        let tmp_dir = self.scratch_dir()?;
        let ret = self
            .restore_in(tmp_dir.path(), bucket, encrypted_blob, &dek_blob, &restored, key_ref)
            .await;
        // plaintext may still sit in the scratch directory; the remote pair
        // is kept unless it is gone
        match ret {
            Ok(_) => close_scratch(tmp_dir)?,
            Err(e) => {
                if let Err(close_err) = close_scratch(tmp_dir) {
                    warn!("{}", close_err.message());
                }
                return Err(e);
            }
        }

        self.store.delete_object(bucket, encrypted_blob).await?;
        self.store.delete_object(bucket, &dek_blob).await?;

        info!("restored '{}/{}' from '{}'", bucket, restored, encrypted_blob);
        Ok(restored)
    }

    async fn restore_in(
        &self,
        tmp_dir: &Path,
        bucket: &str,
        encrypted_blob: &str,
        dek_blob: &str,
        restored: &str,
        key_ref: &KeyRef,
    ) -> Result<()> {
        let local_encrypted = tmp_dir.join("blob.encrypted");
        let local_plain = tmp_dir.join("blob");

        self.store
            .get_object_to_file(bucket, encrypted_blob, &local_encrypted)
            .await?;
        let wrapped = self.store.get_object(bucket, dek_blob).await?;

        let dek_bytes = self.wrapper.unwrap(key_ref, &wrapped).await?;
        let dek = Key::from_slice(&dek_bytes).map_err(|e| Error::DecryptionFailed {
            message: format!("unwrapped DEK from '{}' is unusable ({})", dek_blob, e.message()),
        })?;
        drop(dek_bytes);

        cipher::decrypt_file(&local_encrypted, &local_plain, &dek).map_err(|e| match e {
            Error::Crypto { kind, message } => Error::DecryptionFailed {
                message: format!(
                    "'{}' does not open with the DEK in '{}' ({}: {})",
                    encrypted_blob, dek_blob, kind, message
                ),
            },
            other => other,
        })?;
        drop(dek);

        self.store
            .put_object_from_file(bucket, restored, &local_plain)
            .await
    }

    /// Lists ".encrypted"/".dek" objects that are missing their other half.
    /// Report only; nothing is deleted.
    pub async fn find_orphans(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<Orphan>> {
        self.store.get_bucket(bucket).await?;
        let names = self.store.list_objects(bucket, prefix).await?;
        let orphans = artifacts::find_orphans(&names);
        for o in orphans.iter() {
            warn!("orphaned artifact in '{}': {}", bucket, o);
        }
        info!(
            "checked {} object(s) in '{}', found {} orphan(s)",
            names.len(),
            bucket,
            orphans.len()
        );
        Ok(orphans)
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut b = tempfile::Builder::new();
        b.prefix("blob-envelope-");
        let ret = match &self.temp_root {
            Some(root) => b.tempdir_in(root),
            None => b.tempdir(),
        };
        ret.map_err(|e| Error::Other {
            message: format!("failed to create temporary directory ({})", e),
            is_retryable: false,
        })
    }
}

/// Removes a per-call scratch directory and everything in it.
fn close_scratch(tmp_dir: TempDir) -> Result<()> {
    let tmp_path = tmp_dir.path().to_path_buf();
    tmp_dir.close().map_err(|e| Error::Other {
        message: format!("failed to remove {} ({})", tmp_path.display(), e),
        is_retryable: false,
    })
}

/// Reads the whole source file, failing early if it is missing.
async fn check_source(source_path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(source_path).await.map_err(|e| Error::Other {
        message: format!("failed to read source {} ({})", source_path.display(), e),
        is_retryable: false,
    })
}

#[cfg(test)]
mod test_fixtures {
    use std::{path::PathBuf, sync::Arc};

    use crate::{kms, storage};

    pub const BUCKET: &str = "test-bucket";
    pub const DESTINATION: &str = "test/upload_example1.csv";
    pub const CONTENTS: &[u8] = b"id,name,score\n1,alpha,0.5\n2,beta,0.75\n";

    pub struct Fixture {
        pub store: Arc<storage::memory::Store>,
        pub kms: Arc<kms::memory::Kms>,
        pub manager: super::Manager,
        pub key_ref: kms::KeyRef,
        pub source: PathBuf,
        pub scratch: PathBuf,
        _tmp_dir: tempfile::TempDir,
    }

    pub fn new() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();

        let tmp_dir = tempfile::tempdir().unwrap();
        let source = tmp_dir.path().join("upload_example1.csv");
        std::fs::write(&source, CONTENTS).unwrap();
        let scratch = tmp_dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();

        let store = Arc::new(storage::memory::Store::with_buckets(&[BUCKET]));
        let kms = Arc::new(kms::memory::Kms::new());
        let manager = super::Manager::new(store.clone(), kms.clone()).with_temp_root(&scratch);
        Fixture {
            store,
            kms,
            manager,
            key_ref: kms::KeyRef::new("test-project", "europe-west2", "test_key_ring", "test_key"),
            source,
            scratch,
            _tmp_dir: tmp_dir,
        }
    }

    impl Fixture {
        pub fn scratch_is_empty(&self) -> bool {
            std::fs::read_dir(&self.scratch).unwrap().count() == 0
        }
    }
}

#[cfg(test)]
macro_rules! ab {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

/// RUST_LOG=debug cargo test --package blob-envelope --lib -- envelope::test_upload_plain --exact --show-output
#[test]
fn test_upload_plain() {
    let f = test_fixtures::new();
    ab!(f
        .manager
        .upload_plain(test_fixtures::BUCKET, &f.source, test_fixtures::DESTINATION))
    .unwrap();
    assert_eq!(
        f.store
            .object(test_fixtures::BUCKET, test_fixtures::DESTINATION)
            .unwrap(),
        test_fixtures::CONTENTS
    );
    assert_eq!(f.kms.calls(), crate::kms::memory::Calls::default());

    assert!(ab!(f
        .manager
        .upload_plain("missing-bucket", &f.source, test_fixtures::DESTINATION))
    .is_err());
    assert!(ab!(f.manager.upload_plain(
        test_fixtures::BUCKET,
        &f.source.with_extension("missing"),
        "x"
    ))
    .is_err());
}

/// RUST_LOG=debug cargo test --package blob-envelope --lib -- envelope::test_encrypt_then_decrypt --exact --show-output
#[test]
fn test_encrypt_then_decrypt() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;
    let dest = test_fixtures::DESTINATION;

    ab!(f
        .manager
        .encrypt_and_upload(bucket, &f.source, dest, &f.key_ref))
    .unwrap();
    assert_eq!(
        f.store.names(bucket),
        vec![
            String::from("test/upload_example1.csv.dek"),
            String::from("test/upload_example1.csv.encrypted"),
        ]
    );
    let ciphertext = f
        .store
        .object(bucket, "test/upload_example1.csv.encrypted")
        .unwrap();
    assert_ne!(ciphertext, test_fixtures::CONTENTS);
    // the wrapped DEK is opaque bytes, never the raw 32-byte key
    assert_ne!(
        f.store
            .object(bucket, "test/upload_example1.csv.dek")
            .unwrap()
            .len(),
        crate::cipher::KEY_LEN
    );
    assert_eq!(f.kms.key_ring_count("test-project", "europe-west2"), 1);

    // a second upload re-uses the ring and key
    ab!(f
        .manager
        .encrypt_and_upload(bucket, &f.source, dest, &f.key_ref))
    .unwrap();
    assert_eq!(f.kms.calls().create_key_ring, 1);
    assert_eq!(f.kms.calls().create_key, 1);

    let restored = ab!(f.manager.download_and_decrypt(
        bucket,
        "test/upload_example1.csv.encrypted",
        &f.key_ref
    ))
    .unwrap();
    assert_eq!(restored, dest);
    assert_eq!(f.store.names(bucket), vec![String::from(dest)]);
    assert_eq!(f.store.object(bucket, dest).unwrap(), test_fixtures::CONTENTS);
    assert!(f.scratch_is_empty());
}

#[test]
fn test_decrypt_tampered_ciphertext() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;
    let encrypted = "test/upload_example1.csv.encrypted";

    ab!(f.manager.encrypt_and_upload(
        bucket,
        &f.source,
        test_fixtures::DESTINATION,
        &f.key_ref
    ))
    .unwrap();

    let mut d = f.store.object(bucket, encrypted).unwrap();
    let last = d.len() - 1;
    d[last] ^= 0x01;
    ab!(f.store.put_object(bucket, encrypted, d)).unwrap();

    let err = ab!(f.manager.download_and_decrypt(bucket, encrypted, &f.key_ref)).unwrap_err();
    assert!(matches!(err, Error::DecryptionFailed { .. }));

    // both remote halves stay, nothing restored, nothing left locally
    assert_eq!(f.store.names(bucket).len(), 2);
    assert!(f.store.object(bucket, test_fixtures::DESTINATION).is_none());
    assert!(f.scratch_is_empty());
}

#[test]
fn test_decrypt_with_wrong_key_ref() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;
    let encrypted = "test/upload_example1.csv.encrypted";

    ab!(f.manager.encrypt_and_upload(
        bucket,
        &f.source,
        test_fixtures::DESTINATION,
        &f.key_ref
    ))
    .unwrap();

    let other = KeyRef::new("test-project", "europe-west2", "test_key_ring", "other_key");
    ab!(Provisioner::new(f.kms.clone()).ensure(&other)).unwrap();

    // the KMS refuses to unwrap; that is reported as the KMS error, not as tampering
    let err = ab!(f.manager.download_and_decrypt(bucket, encrypted, &other)).unwrap_err();
    assert!(matches!(err, Error::API { .. }));
    assert_eq!(f.store.names(bucket).len(), 2);
    assert!(f.scratch_is_empty());

    // the right reference still works afterwards
    ab!(f.manager.download_and_decrypt(bucket, encrypted, &f.key_ref)).unwrap();
}

#[test]
fn test_decrypt_rejects_unsuffixed_name() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;

    ab!(f.manager.upload_plain(bucket, &f.source, test_fixtures::DESTINATION)).unwrap();
    for name in [test_fixtures::DESTINATION, ".encrypted", "test/.encrypted"] {
        let err = ab!(f.manager.download_and_decrypt(bucket, name, &f.key_ref)).unwrap_err();
        assert!(matches!(err, Error::Other { .. }));
    }
    assert_eq!(f.kms.calls(), crate::kms::memory::Calls::default());
    assert_eq!(
        f.store.names(bucket),
        vec![String::from(test_fixtures::DESTINATION)]
    );
}

#[test]
fn test_encrypt_failed_dek_upload_is_not_compensated() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;

    f.store.fail_puts_with_suffix(".dek");
    let err = ab!(f.manager.encrypt_and_upload(
        bucket,
        &f.source,
        test_fixtures::DESTINATION,
        &f.key_ref
    ))
    .unwrap_err();
    assert!(err.is_retryable());
    f.store.clear_failures();

    assert_eq!(
        f.store.names(bucket),
        vec![String::from("test/upload_example1.csv.encrypted")]
    );
    assert_eq!(
        ab!(f.manager.find_orphans(bucket, None)).unwrap(),
        vec![Orphan::MissingDek {
            name: String::from(test_fixtures::DESTINATION)
        }]
    );
    // report only
    assert_eq!(f.store.names(bucket).len(), 1);
}

#[test]
fn test_decrypt_failed_delete_leaves_orphan() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;

    ab!(f.manager.encrypt_and_upload(
        bucket,
        &f.source,
        test_fixtures::DESTINATION,
        &f.key_ref
    ))
    .unwrap();

    f.store.fail_deletes_with_suffix(".dek");
    assert!(ab!(f.manager.download_and_decrypt(
        bucket,
        "test/upload_example1.csv.encrypted",
        &f.key_ref
    ))
    .is_err());
    f.store.clear_failures();

    // plaintext was restored before any delete
    assert_eq!(
        f.store.object(bucket, test_fixtures::DESTINATION).unwrap(),
        test_fixtures::CONTENTS
    );
    assert_eq!(
        ab!(f.manager.find_orphans(bucket, Some("test/"))).unwrap(),
        vec![Orphan::MissingCiphertext {
            name: String::from(test_fixtures::DESTINATION)
        }]
    );
    assert!(f.scratch_is_empty());
}

#[test]
fn test_permission_denied_aborts_before_upload() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;

    f.kms.set_denied(true);
    let err = ab!(f.manager.encrypt_and_upload(
        bucket,
        &f.source,
        test_fixtures::DESTINATION,
        &f.key_ref
    ))
    .unwrap_err();
    assert!(err.is_permission());
    assert!(f.store.names(bucket).is_empty());
    assert_eq!(f.kms.calls().list_key_rings, 1);
}

#[test]
fn test_decrypt_failed_upload_keeps_pair() {
    let f = test_fixtures::new();
    let bucket = test_fixtures::BUCKET;

    ab!(f.manager.encrypt_and_upload(
        bucket,
        &f.source,
        test_fixtures::DESTINATION,
        &f.key_ref
    ))
    .unwrap();

    f.store.fail_puts_with_suffix(".csv");
    let err = ab!(f.manager.download_and_decrypt(
        bucket,
        "test/upload_example1.csv.encrypted",
        &f.key_ref
    ))
    .unwrap_err();
    assert!(err.is_retryable());
    f.store.clear_failures();

    // nothing deleted, nothing restored, no plaintext left locally
    assert_eq!(
        f.store.names(bucket),
        vec![
            String::from("test/upload_example1.csv.dek"),
            String::from("test/upload_example1.csv.encrypted"),
        ]
    );
    assert!(f.store.object(bucket, test_fixtures::DESTINATION).is_none());
    assert!(f.scratch_is_empty());
    assert!(ab!(f.manager.find_orphans(bucket, None)).unwrap().is_empty());

    // the pair still restores once uploads work again
    ab!(f.manager.download_and_decrypt(
        bucket,
        "test/upload_example1.csv.encrypted",
        &f.key_ref
    ))
    .unwrap();
    assert_eq!(
        f.store.object(bucket, test_fixtures::DESTINATION).unwrap(),
        test_fixtures::CONTENTS
    );
}

#[test]
fn test_close_scratch_reports_failure() {
    let f = test_fixtures::new();

    let tmp_dir = f.manager.scratch_dir().unwrap();
    assert!(!f.scratch_is_empty());
    close_scratch(tmp_dir).unwrap();
    assert!(f.scratch_is_empty());

    // a scratch directory that cannot be removed is an error, not a warning
    let tmp_dir = f.manager.scratch_dir().unwrap();
    std::fs::remove_dir_all(tmp_dir.path()).unwrap();
    let err = close_scratch(tmp_dir).unwrap_err();
    assert!(matches!(err, Error::Other { .. }));
    assert!(err.message().contains("failed to remove"));
}
