use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Classifies local cipher failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoErrorKind {
    /// Key material has the wrong size or could not be loaded into the cipher.
    InvalidKey,
    /// Token failed authentication, was truncated, or uses an unknown version.
    InvalidToken,
    /// Token is older than the allowed time-to-live.
    Expired,
    /// System random source failed.
    Random,
}

impl fmt::Display for CryptoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoErrorKind::InvalidKey => write!(f, "invalid key"),
            CryptoErrorKind::InvalidToken => write!(f, "invalid token"),
            CryptoErrorKind::Expired => write!(f, "expired token"),
            CryptoErrorKind::Random => write!(f, "random source failure"),
        }
    }
}

/// Backing errors for all storage, KMS and cipher operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Remote storage or KMS call failed (network, quota, not-found...).
    #[error("failed API ({message})")]
    API { message: String, is_retryable: bool },
    /// Credentials lack the scope for the storage or KMS operation.
    #[error("permission denied ({message})")]
    Permission { message: String },
    /// Remote resource creation raced with another creator.
    #[error("already exists ({message})")]
    AlreadyExists { message: String },
    #[error("crypto failure: {kind} ({message})")]
    Crypto {
        kind: CryptoErrorKind,
        message: String,
    },
    /// Ciphertext could not be opened with the unwrapped DEK: either the key
    /// reference is wrong or the ".encrypted"/".dek" pair is mismatched.
    #[error("decryption failed ({message})")]
    DecryptionFailed { message: String },
    #[error("failed for other reasons ({message})")]
    Other { message: String, is_retryable: bool },
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::API { message, .. }
            | Error::Permission { message }
            | Error::AlreadyExists { message }
            | Error::Crypto { message, .. }
            | Error::DecryptionFailed { message }
            | Error::Other { message, .. } => message.clone(),
        }
    }

    /// Returns if the error is retryable.
    /// Nothing in this crate retries; the flag is for the caller's policy.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::API { is_retryable, .. } | Error::Other { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    #[inline]
    #[must_use]
    pub fn is_permission(&self) -> bool {
        matches!(self, Error::Permission { .. })
    }

    /// Returns the cipher failure kind, if any.
    #[inline]
    #[must_use]
    pub fn crypto_kind(&self) -> Option<CryptoErrorKind> {
        match self {
            Error::Crypto { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn crypto(kind: CryptoErrorKind, message: impl Into<String>) -> Self {
        Error::Crypto {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn other(message: impl Into<String>) -> Self {
        Error::Other {
            message: message.into(),
            is_retryable: false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let is_retryable = matches!(
            e.kind(),
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
        );
        Error::Other {
            message: format!("io error {}", e),
            is_retryable,
        }
    }
}

/// Converts into "io::Error" for the binaries, which report "io::Result".
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Permission { .. } => std::io::ErrorKind::PermissionDenied,
            Error::AlreadyExists { .. } => std::io::ErrorKind::AlreadyExists,
            Error::Crypto { .. } | Error::DecryptionFailed { .. } => {
                std::io::ErrorKind::InvalidData
            }
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e.to_string())
    }
}

#[test]
fn test_error_flags() {
    let e = Error::API {
        message: String::from("throttled"),
        is_retryable: true,
    };
    assert!(e.is_retryable());
    assert_eq!(e.message(), "throttled");

    let e = Error::Permission {
        message: String::from("kms:Encrypt"),
    };
    assert!(e.is_permission());
    assert!(!e.is_retryable());

    let e = Error::crypto(CryptoErrorKind::Expired, "too old");
    assert_eq!(e.crypto_kind(), Some(CryptoErrorKind::Expired));
    assert!(!e.is_retryable());

    let io_err: std::io::Error = Error::DecryptionFailed {
        message: String::from("bad tag"),
    }
    .into();
    assert_eq!(io_err.kind(), std::io::ErrorKind::InvalidData);
}
