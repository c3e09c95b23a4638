use std::{env, io::Write, sync::Arc};

use log::info;

use blob_envelope::{aws, kms, storage};

/// Round-trips a file through S3 with an AWS KMS-wrapped DEK.
///
/// BUCKET=my-bucket cargo run --example s3_kms_round_trip
fn main() {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let bucket = env::var("BUCKET").unwrap_or_else(|_| String::from("blob-envelope-test"));
    let region = env::var("AWS_REGION").unwrap_or_else(|_| String::from("us-west-2"));

    let shared_config = ab!(aws::load_config(Some(region.clone())));
    let s3_manager = Arc::new(storage::s3::Manager::new(&shared_config));
    let kms_manager = Arc::new(kms::aws::Manager::new(&shared_config));
    let manager = blob_envelope::envelope::Manager::new(s3_manager.clone(), kms_manager);

    let key_ref = kms::KeyRef::new("blob-envelope", &region, "examples", "round-trip");

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"id,name\n1,alpha\n2,beta\n").unwrap();

    info!("uploading to '{}'", bucket);
    ab!(manager.encrypt_and_upload(&bucket, f.path(), "examples/round-trip.csv", &key_ref))
        .unwrap();
    assert!(ab!(manager.find_orphans(&bucket, Some("examples/")))
        .unwrap()
        .is_empty());

    let restored = ab!(manager.download_and_decrypt(
        &bucket,
        "examples/round-trip.csv.encrypted",
        &key_ref
    ))
    .unwrap();
    let d = ab!(storage::ObjectStore::get_object(
        s3_manager.as_ref(),
        &bucket,
        &restored
    ))
    .unwrap();
    assert_eq!(d, b"id,name\n1,alpha\n2,beta\n");

    ab!(storage::ObjectStore::delete_object(
        s3_manager.as_ref(),
        &bucket,
        &restored
    ))
    .unwrap();
    info!("round trip through '{}' with '{}' done", bucket, key_ref);
}
