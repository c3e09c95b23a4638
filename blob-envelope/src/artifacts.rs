//! Object names making up the encrypted form of a logical file "name":
//! "name.encrypted" holds the file ciphertext and "name.dek" the KMS-wrapped DEK.
//! The two objects must exist together or not at all.

use std::{collections::BTreeSet, fmt};

use crate::errors::{Error, Result};

pub const ENCRYPTED_SUFFIX: &str = ".encrypted";
pub const DEK_SUFFIX: &str = ".dek";

/// e.g., "test/upload_example1.csv" -> "test/upload_example1.csv.encrypted"
pub fn encrypted_name(name: &str) -> String {
    format!("{}{}", name, ENCRYPTED_SUFFIX)
}

/// e.g., "test/upload_example1.csv" -> "test/upload_example1.csv.dek"
pub fn dek_name(name: &str) -> String {
    format!("{}{}", name, DEK_SUFFIX)
}

/// Returns the logical name of an encrypted blob, i.e. the name minus the
/// trailing ".encrypted". Fails if the suffix is missing or nothing precedes it.
pub fn restored_name(encrypted_blob: &str) -> Result<String> {
    match encrypted_blob.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(stem) if !stem.is_empty() && !stem.ends_with('/') => Ok(stem.to_string()),
        _ => Err(Error::Other {
            message: format!(
                "'{}' is not an encrypted blob name (expected '<name>{}')",
                encrypted_blob, ENCRYPTED_SUFFIX
            ),
            is_retryable: false,
        }),
    }
}

/// Returns the sibling DEK name, replacing only the trailing ".encrypted".
pub fn dek_name_for_encrypted(encrypted_blob: &str) -> Result<String> {
    Ok(dek_name(&restored_name(encrypted_blob)?))
}

/// One half of an artifact pair found without the other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Orphan {
    /// "name.encrypted" exists, "name.dek" does not.
    MissingDek { name: String },
    /// "name.dek" exists, "name.encrypted" does not.
    MissingCiphertext { name: String },
}

impl Orphan {
    /// Logical file name the orphan belongs to.
    pub fn name(&self) -> &str {
        match self {
            Orphan::MissingDek { name } | Orphan::MissingCiphertext { name } => name,
        }
    }

    /// Object name of the half that exists.
    pub fn present_object(&self) -> String {
        match self {
            Orphan::MissingDek { name } => encrypted_name(name),
            Orphan::MissingCiphertext { name } => dek_name(name),
        }
    }

    /// Object name of the half that is missing.
    pub fn missing_object(&self) -> String {
        match self {
            Orphan::MissingDek { name } => dek_name(name),
            Orphan::MissingCiphertext { name } => encrypted_name(name),
        }
    }
}

impl fmt::Display for Orphan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' exists without '{}'",
            self.present_object(),
            self.missing_object()
        )
    }
}

/// Pairs up ".encrypted" and ".dek" names and returns the unpaired ones,
/// ordered by logical name. Other object names are ignored.
pub fn find_orphans<S: AsRef<str>>(object_names: &[S]) -> Vec<Orphan> {
    let mut encrypted = BTreeSet::new();
    let mut deks = BTreeSet::new();
    for n in object_names {
        let n = n.as_ref();
        if let Some(stem) = n.strip_suffix(ENCRYPTED_SUFFIX) {
            if !stem.is_empty() {
                encrypted.insert(stem);
            }
        } else if let Some(stem) = n.strip_suffix(DEK_SUFFIX) {
            if !stem.is_empty() {
                deks.insert(stem);
            }
        }
    }

    let mut orphans: Vec<Orphan> = encrypted
        .difference(&deks)
        .map(|n| Orphan::MissingDek {
            name: n.to_string(),
        })
        .chain(deks.difference(&encrypted).map(|n| Orphan::MissingCiphertext {
            name: n.to_string(),
        }))
        .collect();
    orphans.sort_by(|a, b| a.name().cmp(b.name()).then(a.cmp(b)));
    orphans
}

#[test]
fn test_artifact_names() {
    assert_eq!(
        encrypted_name("test/upload_example1.csv"),
        "test/upload_example1.csv.encrypted"
    );
    assert_eq!(dek_name("test/upload_example1.csv"), "test/upload_example1.csv.dek");
    assert_eq!(
        restored_name("test/upload_example1.csv.encrypted").unwrap(),
        "test/upload_example1.csv"
    );
    assert_eq!(
        dek_name_for_encrypted("test/upload_example1.csv.encrypted").unwrap(),
        "test/upload_example1.csv.dek"
    );

    // only the trailing suffix is replaced
    assert_eq!(
        dek_name_for_encrypted("a.encrypted.b.encrypted").unwrap(),
        "a.encrypted.b.dek"
    );

    assert!(restored_name("test/upload_example1.csv").is_err());
    assert!(restored_name(".encrypted").is_err());
    assert!(restored_name("dir/.encrypted").is_err());
    assert!(dek_name_for_encrypted("x.dek").is_err());
}

#[test]
fn test_find_orphans() {
    let names = vec![
        "a.csv",
        "a.csv.dek",
        "a.csv.encrypted",
        "b.csv.encrypted",
        "c.csv.dek",
        "notes.txt",
    ];
    let orphans = find_orphans(&names);
    assert_eq!(
        orphans,
        vec![
            Orphan::MissingDek {
                name: String::from("b.csv")
            },
            Orphan::MissingCiphertext {
                name: String::from("c.csv")
            },
        ]
    );
    assert_eq!(
        orphans[0].to_string(),
        "'b.csv.encrypted' exists without 'b.csv.dek'"
    );
    assert!(find_orphans::<&str>(&[]).is_empty());
}
