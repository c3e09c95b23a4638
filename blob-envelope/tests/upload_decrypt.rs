use std::path::{Path, PathBuf};

use blob_envelope::{
    artifacts::Orphan,
    config::{Config, StorageBackend},
    errors::Error,
    kms::{local::Kms, KeyManagementService},
    storage::{local::Store, ObjectStore},
};

macro_rules! ab {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

const BUCKET: &str = "test-bucket";
const DESTINATION: &str = "test/upload_example1.csv";

fn example_csv() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("resources")
        .join("upload_example1.csv")
}

/// Writes a local-disk configuration, loads it back, and creates the bucket.
fn setup(root: &Path) -> (Config, Store) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut cfg = Config::default_local(root.to_str().unwrap(), "test-project");
    if let Some(k) = cfg.kms_key.as_mut() {
        k.location = String::from("europe-west2");
        k.key_ring = String::from("test_key_ring");
        k.key = String::from("test_key");
    }
    let scratch = root.join("scratch");
    std::fs::create_dir_all(&scratch).unwrap();
    cfg.temp_dir = Some(scratch.display().to_string());

    let config_path = root.join("config.yaml");
    let config_path = config_path.to_str().unwrap();
    cfg.sync(config_path).unwrap();
    let cfg = Config::load(config_path).unwrap();
    cfg.validate().unwrap();

    let store = match &cfg.storage {
        StorageBackend::Local { root_dir } => Store::new(root_dir),
        other => panic!("unexpected storage {:?}", other),
    };
    ab!(store.create_bucket(BUCKET)).unwrap();
    (cfg, store)
}

/// RUST_LOG=debug cargo test --package blob-envelope --test upload_decrypt -- test_upload_plain --exact --show-output
#[test]
fn test_upload_plain() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (cfg, store) = setup(tmp_dir.path());
    let manager = ab!(cfg.envelope_manager());

    ab!(manager.upload_plain(BUCKET, &example_csv(), DESTINATION)).unwrap();

    assert_eq!(
        ab!(store.list_objects(BUCKET, None)).unwrap(),
        vec![String::from(DESTINATION)]
    );
    assert_eq!(
        ab!(store.get_object(BUCKET, DESTINATION)).unwrap(),
        std::fs::read(example_csv()).unwrap()
    );
}

/// RUST_LOG=debug cargo test --package blob-envelope --test upload_decrypt -- test_upload_encrypted_then_decrypt --exact --show-output
#[test]
fn test_upload_encrypted_then_decrypt() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (cfg, store) = setup(tmp_dir.path());
    let manager = ab!(cfg.envelope_manager());
    let key_ref = cfg.key_ref(None, None, None).unwrap();
    let original = std::fs::read(example_csv()).unwrap();

    ab!(manager.encrypt_and_upload(BUCKET, &example_csv(), DESTINATION, &key_ref)).unwrap();
    assert_eq!(
        ab!(store.list_objects(BUCKET, Some("test/"))).unwrap(),
        vec![
            String::from("test/upload_example1.csv.dek"),
            String::from("test/upload_example1.csv.encrypted"),
        ]
    );
    assert_ne!(
        ab!(store.get_object(BUCKET, "test/upload_example1.csv.encrypted")).unwrap(),
        original
    );
    assert!(ab!(manager.find_orphans(BUCKET, None)).unwrap().is_empty());

    // the key hierarchy persists on disk
    let kms_root = tmp_dir.path().join("kms");
    let kms = Kms::new(&kms_root);
    assert_eq!(
        ab!(kms.list_key_rings("test-project", "europe-west2")).unwrap(),
        vec![String::from("test_key_ring")]
    );
    assert_eq!(
        ab!(kms.list_keys("test-project", "europe-west2", "test_key_ring")).unwrap(),
        vec![String::from("test_key")]
    );

    // a fresh manager (new process, same config) can decrypt
    let manager = ab!(cfg.envelope_manager());
    let restored = ab!(manager.download_and_decrypt(
        BUCKET,
        "test/upload_example1.csv.encrypted",
        &key_ref
    ))
    .unwrap();
    assert_eq!(restored, DESTINATION);
    assert_eq!(
        ab!(store.list_objects(BUCKET, None)).unwrap(),
        vec![String::from(DESTINATION)]
    );
    assert_eq!(ab!(store.get_object(BUCKET, DESTINATION)).unwrap(), original);
    assert_eq!(
        std::fs::read_dir(tmp_dir.path().join("scratch"))
            .unwrap()
            .count(),
        0
    );
}

#[test]
fn test_mismatched_pair_fails_without_side_effects() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (cfg, store) = setup(tmp_dir.path());
    let manager = ab!(cfg.envelope_manager());
    let key_ref = cfg.key_ref(None, None, None).unwrap();

    let other_src = tmp_dir.path().join("other.csv");
    std::fs::write(&other_src, b"id\n42\n").unwrap();

    ab!(manager.encrypt_and_upload(BUCKET, &example_csv(), "a.csv", &key_ref)).unwrap();
    ab!(manager.encrypt_and_upload(BUCKET, &other_src, "b.csv", &key_ref)).unwrap();

    // swap in b's DEK next to a's ciphertext
    let b_dek = ab!(store.get_object(BUCKET, "b.csv.dek")).unwrap();
    ab!(store.put_object(BUCKET, "a.csv.dek", b_dek)).unwrap();

    let err = ab!(manager.download_and_decrypt(BUCKET, "a.csv.encrypted", &key_ref)).unwrap_err();
    assert!(matches!(err, Error::DecryptionFailed { .. }));
    assert_eq!(ab!(store.list_objects(BUCKET, None)).unwrap().len(), 4);

    // "b" still round-trips
    ab!(manager.download_and_decrypt(BUCKET, "b.csv.encrypted", &key_ref)).unwrap();
    assert_eq!(ab!(store.get_object(BUCKET, "b.csv")).unwrap(), b"id\n42\n");
}

#[test]
fn test_orphan_report() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (cfg, store) = setup(tmp_dir.path());
    let manager = ab!(cfg.envelope_manager());
    let key_ref = cfg.key_ref(None, None, None).unwrap();

    ab!(manager.encrypt_and_upload(BUCKET, &example_csv(), DESTINATION, &key_ref)).unwrap();
    ab!(store.delete_object(BUCKET, "test/upload_example1.csv.dek")).unwrap();
    ab!(store.put_object(BUCKET, "stray.dek", vec![1, 2, 3])).unwrap();

    assert_eq!(
        ab!(manager.find_orphans(BUCKET, None)).unwrap(),
        vec![
            Orphan::MissingCiphertext {
                name: String::from("stray")
            },
            Orphan::MissingDek {
                name: String::from(DESTINATION)
            },
        ]
    );
    assert_eq!(ab!(store.list_objects(BUCKET, None)).unwrap().len(), 2);
    assert!(ab!(manager.find_orphans("missing-bucket", None)).is_err());
}
