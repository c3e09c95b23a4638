use std::{
    fs::{self, File},
    io::{self, Error, ErrorKind, Write},
    path::Path,
    sync::Arc,
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    aws, envelope,
    kms::{self, KeyManagementService, KeyRef},
    storage::{self, ObjectStore},
};

/// Defines the envelope-encryption configuration file.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Project that owns the key hierarchy.
    pub project: String,
    /// Default key-encryption key; command-line flags override each field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key: Option<KmsKey>,

    pub storage: StorageBackend,
    pub kms: KmsBackend,

    /// Parent of the per-call scratch directories.
    /// Defaults to the system temporary directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub struct KmsKey {
    pub location: String,
    pub key_ring: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Buckets are directories under "root_dir".
    Local { root_dir: String },
    S3 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KmsBackend {
    /// Key rings are directories and keys are files under "root_dir".
    Local { root_dir: String },
    Aws {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
}

impl Config {
    /// Returns a configuration with both backends on the local disk.
    pub fn default_local(root_dir: &str, project: &str) -> Self {
        let root = Path::new(root_dir);
        Self {
            project: project.to_string(),
            kms_key: Some(KmsKey {
                location: String::from("local"),
                key_ring: String::from("default"),
                key: String::from("default"),
            }),
            storage: StorageBackend::Local {
                root_dir: root.join("buckets").display().to_string(),
            },
            kms: KmsBackend::Local {
                root_dir: root.join("kms").display().to_string(),
            },
            temp_dir: None,
        }
    }

    /// Returns a configuration backed by AWS S3 and AWS KMS.
    pub fn default_aws(region: &str, project: &str) -> Self {
        Self {
            project: project.to_string(),
            kms_key: Some(KmsKey {
                location: region.to_string(),
                key_ring: String::from("default"),
                key: String::from("default"),
            }),
            storage: StorageBackend::S3 {
                region: Some(region.to_string()),
            },
            kms: KmsBackend::Aws {
                region: Some(region.to_string()),
            },
            temp_dir: None,
        }
    }

    /// Converts to string in YAML format.
    pub fn encode_yaml(&self) -> io::Result<String> {
        serde_yaml::to_string(&self).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to serialize Config to YAML {}", e),
            )
        })
    }

    /// Saves the current configuration to disk
    /// and overwrites the file.
    pub fn sync(&self, file_path: &str) -> io::Result<()> {
        info!("syncing Config to '{}'", file_path);
        let path = Path::new(file_path);
        if let Some(parent_dir) = path.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        let d = self.encode_yaml()?;
        let mut f = File::create(file_path)?;
        f.write_all(d.as_bytes())?;

        Ok(())
    }

    pub fn load(file_path: &str) -> io::Result<Self> {
        info!("loading Config from {}", file_path);

        if !Path::new(file_path).exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("file {} does not exists", file_path),
            ));
        }

        let f = File::open(file_path).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to open {} ({})", file_path, e),
            )
        })?;
        serde_yaml::from_reader(f)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("invalid YAML: {}", e)))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> io::Result<()> {
        info!("validating Config");

        if self.project.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "'project' cannot be empty",
            ));
        }
        if let Some(k) = &self.kms_key {
            for (name, v) in [
                ("kms_key.location", &k.location),
                ("kms_key.key_ring", &k.key_ring),
                ("kms_key.key", &k.key),
            ] {
                if v.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!("'{}' cannot be empty", name),
                    ));
                }
            }
        }

        match &self.storage {
            StorageBackend::Local { root_dir } if root_dir.is_empty() => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "'storage.root_dir' cannot be empty",
                ));
            }
            StorageBackend::S3 { region: Some(r) } if r.is_empty() => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "'storage.region' cannot be empty",
                ));
            }
            _ => {}
        }
        match &self.kms {
            KmsBackend::Local { root_dir } if root_dir.is_empty() => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "'kms.root_dir' cannot be empty",
                ));
            }
            KmsBackend::Aws { region: Some(r) } if r.is_empty() => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "'kms.region' cannot be empty",
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// Resolves the key reference. A flag value wins over the "kms_key"
    /// section; it is an error if any field ends up missing.
    pub fn key_ref(
        &self,
        location: Option<&str>,
        key_ring: Option<&str>,
        key: Option<&str>,
    ) -> io::Result<KeyRef> {
        let pick = |flag: Option<&str>, from_file: Option<&String>, name: &str| {
            match flag.filter(|v| !v.is_empty()).or(from_file.map(String::as_str)) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("no {} given by flag or in 'kms_key'", name),
                )),
            }
        };
        let k = self.kms_key.as_ref();
        let location = pick(location, k.map(|k| &k.location), "location")?;
        let key_ring = pick(key_ring, k.map(|k| &k.key_ring), "key ring")?;
        let key = pick(key, k.map(|k| &k.key), "key")?;
        Ok(KeyRef::new(&self.project, &location, &key_ring, &key))
    }

    /// Builds the configured object-store client.
    pub async fn object_store(&self) -> Arc<dyn ObjectStore> {
        match &self.storage {
            StorageBackend::Local { root_dir } => Arc::new(storage::local::Store::new(root_dir)),
            StorageBackend::S3 { region } => {
                let shared_config = aws::load_config(region.clone()).await;
                Arc::new(storage::s3::Manager::new(&shared_config))
            }
        }
    }

    /// Builds the configured KMS client.
    pub async fn key_management(&self) -> Arc<dyn KeyManagementService> {
        match &self.kms {
            KmsBackend::Local { root_dir } => Arc::new(kms::local::Kms::new(root_dir)),
            KmsBackend::Aws { region } => {
                let shared_config = aws::load_config(region.clone()).await;
                Arc::new(kms::aws::Manager::new(&shared_config))
            }
        }
    }

    /// Builds the envelope manager over the configured backends.
    pub async fn envelope_manager(&self) -> envelope::Manager {
        let m = envelope::Manager::new(self.object_store().await, self.key_management().await);
        match &self.temp_dir {
            Some(d) => m.with_temp_root(d),
            None => m,
        }
    }
}

/// RUST_LOG=debug cargo test --package blob-envelope --lib -- config::test_config --exact --show-output
#[test]
fn test_config() {
    let _ = env_logger::builder().is_test(true).try_init();

    let contents = r#"

project: test-project
kms_key:
  location: europe-west2
  key_ring: test_key_ring
  key: test_key
storage:
  kind: local
  root_dir: /tmp/blob-envelope/buckets
kms:
  kind: aws
  region: eu-west-2
temp_dir: /tmp/blob-envelope/scratch

"#;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let ret = f.write_all(contents.as_bytes());
    assert!(ret.is_ok());
    let config_path = f.path().to_str().unwrap();

    let cfg = Config::load(config_path).unwrap();
    let expected = Config {
        project: String::from("test-project"),
        kms_key: Some(KmsKey {
            location: String::from("europe-west2"),
            key_ring: String::from("test_key_ring"),
            key: String::from("test_key"),
        }),
        storage: StorageBackend::Local {
            root_dir: String::from("/tmp/blob-envelope/buckets"),
        },
        kms: KmsBackend::Aws {
            region: Some(String::from("eu-west-2")),
        },
        temp_dir: Some(String::from("/tmp/blob-envelope/scratch")),
    };
    assert_eq!(cfg, expected);
    assert!(cfg.validate().is_ok());

    // sync then load back
    let tmp_dir = tempfile::tempdir().unwrap();
    let synced = tmp_dir.path().join("nested").join("config.yaml");
    let synced = synced.to_str().unwrap();
    cfg.sync(synced).unwrap();
    assert_eq!(Config::load(synced).unwrap(), expected);

    // flags override the file, one field at a time
    assert_eq!(
        cfg.key_ref(None, None, None).unwrap(),
        KeyRef::new("test-project", "europe-west2", "test_key_ring", "test_key")
    );
    assert_eq!(
        cfg.key_ref(Some("us-west-2"), None, Some("other")).unwrap(),
        KeyRef::new("test-project", "us-west-2", "test_key_ring", "other")
    );

    let mut no_key = cfg.clone();
    no_key.kms_key = None;
    assert!(no_key.key_ref(Some("l"), Some("r"), None).is_err());
    assert!(no_key.key_ref(Some("l"), Some("r"), Some("k")).is_ok());
    assert!(no_key.validate().is_ok());

    let mut bad = cfg.clone();
    bad.project = String::new();
    assert!(bad.validate().is_err());

    let mut bad = cfg;
    bad.storage = StorageBackend::Local {
        root_dir: String::new(),
    };
    assert!(bad.validate().is_err());

    assert!(Config::load("/does/not/exist.yaml").is_err());

    let local = Config::default_local("/tmp/x", "p");
    assert!(local.validate().is_ok());
    assert!(local.encode_yaml().unwrap().contains("kind: local"));
    assert!(Config::default_aws("us-west-2", "p").validate().is_ok());
}
