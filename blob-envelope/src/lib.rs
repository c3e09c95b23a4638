//! Envelope encryption of files into object storage.
//!
//! Every file is sealed locally with a fresh data-encryption key (DEK); the DEK
//! is wrapped by a key-encryption key that never leaves the KMS. The
//! ciphertext and the wrapped DEK are stored next to each other as
//! "name.encrypted" and "name.dek".

pub mod artifacts;
pub mod aws;
pub mod cipher;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod humanize;
pub mod kms;
pub mod provisioner;
pub mod storage;
pub mod wrapper;
