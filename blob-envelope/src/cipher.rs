//! Authenticated symmetric encryption for file payloads.
//!
//! Tokens are self-describing and laid out as:
//! [ version (1) ][ timestamp seconds, big-endian (8) ][ nonce (12) ][ ciphertext || tag (16) ]
//!
//! The version and timestamp are authenticated as associated data, so any
//! modified byte makes "decrypt" fail.

use std::{
    fmt, fs,
    io::{Cursor, Read, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
/// "NONCE_LEN" is the per-token nonce (iv_length), 12-byte
/// ref. https://www.rfc-editor.org/rfc/rfc8446#appendix-E.2
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    errors::{CryptoErrorKind, Error, Result},
    humanize,
};

/// AES-256 key size.
pub const KEY_LEN: usize = 32;

pub const TOKEN_VERSION: u8 = 0x80;

const TIMESTAMP_LEN: usize = 8;
const HEADER_LEN: usize = 1 + TIMESTAMP_LEN;
const TAG_LEN: usize = 16;
const MIN_TOKEN_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Tokens stamped further than this in the future are rejected
/// when a time-to-live is enforced.
const MAX_CLOCK_SKEW_SECS: u64 = 60;

/// Symmetric key material. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Generates a fresh key from the system random source.
    pub fn generate() -> Result<Self> {
        let mut b = [0u8; KEY_LEN];
        SystemRandom::new().fill(&mut b).map_err(|e| {
            Error::crypto(
                CryptoErrorKind::Random,
                format!("failed to generate ring.random for key ({:?})", e),
            )
        })?;
        Ok(Self(b))
    }

    /// Loads key material, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(b: &[u8]) -> Result<Self> {
        if b.len() != KEY_LEN {
            return Err(Error::crypto(
                CryptoErrorKind::InvalidKey,
                format!("key must be {}-byte, got {}-byte", KEY_LEN, b.len()),
            ));
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(b);
        Ok(Self(k))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn aead(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.0).map_err(|e| {
            Error::crypto(
                CryptoErrorKind::InvalidKey,
                format!("failed to create UnboundKey ({:?})", e),
            )
        })?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key([REDACTED])")
    }
}

/// Returns a fresh random key.
pub fn generate_key() -> Result<Key> {
    Key::generate()
}

/// Encrypts the plaintext into a self-describing token.
/// Two calls with the same input never return the same token.
pub fn encrypt(plaintext: &[u8], key: &Key) -> Result<Vec<u8>> {
    encrypt_at(plaintext, key, now_secs())
}

/// Decrypts a token made by "encrypt", without any age limit.
pub fn decrypt(token: &[u8], key: &Key) -> Result<Vec<u8>> {
    decrypt_at(token, key, None, now_secs())
}

/// Decrypts a token, failing with "Expired" when it is older than "ttl".
pub fn decrypt_with_ttl(token: &[u8], key: &Key, ttl: Duration) -> Result<Vec<u8>> {
    decrypt_at(token, key, Some(ttl), now_secs())
}

fn encrypt_at(plaintext: &[u8], key: &Key, timestamp: u64) -> Result<Vec<u8>> {
    let safe_key = key.aead()?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new().fill(&mut nonce_bytes).map_err(|e| {
        Error::crypto(
            CryptoErrorKind::Random,
            format!("failed to generate ring.random for nonce ({:?})", e),
        )
    })?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(TOKEN_VERSION);
    header.write_u64::<BigEndian>(timestamp)?;

    // overwrites the copied plaintext
    let mut sealed = plaintext.to_vec();
    safe_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&header[..]),
            &mut sealed,
        )
        .map_err(|e| {
            Error::crypto(
                CryptoErrorKind::InvalidKey,
                format!("failed to seal ({:?})", e),
            )
        })?;

    let mut token = Vec::with_capacity(HEADER_LEN + NONCE_LEN + sealed.len());
    token.write_all(&header)?;
    token.write_all(&nonce_bytes)?;
    token.write_all(&sealed)?;

    debug!(
        "sealed {} into token of {}",
        humanize::bytes(plaintext.len()),
        humanize::bytes(token.len())
    );
    Ok(token)
}

fn decrypt_at(token: &[u8], key: &Key, ttl: Option<Duration>, now: u64) -> Result<Vec<u8>> {
    if token.len() < MIN_TOKEN_LEN {
        return Err(Error::crypto(
            CryptoErrorKind::InvalidToken,
            format!(
                "token too short ({}-byte, need at least {}-byte)",
                token.len(),
                MIN_TOKEN_LEN
            ),
        ));
    }

    let mut buf = Cursor::new(token);
    let version = buf.read_u8()?;
    if version != TOKEN_VERSION {
        return Err(Error::crypto(
            CryptoErrorKind::InvalidToken,
            format!("unknown token version 0x{:02x}", version),
        ));
    }
    let timestamp = buf.read_u64::<BigEndian>()?;

    if let Some(ttl) = ttl {
        if timestamp > now.saturating_add(MAX_CLOCK_SKEW_SECS) {
            return Err(Error::crypto(
                CryptoErrorKind::InvalidToken,
                format!("token timestamp {} is ahead of clock {}", timestamp, now),
            ));
        }
        if timestamp.saturating_add(ttl.as_secs()) < now {
            return Err(Error::crypto(
                CryptoErrorKind::Expired,
                format!(
                    "token issued at {} exceeded ttl {}s (now {})",
                    timestamp,
                    ttl.as_secs(),
                    now
                ),
            ));
        }
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    buf.read_exact(&mut nonce_bytes)?;
    let mut sealed = Vec::with_capacity(token.len() - HEADER_LEN - NONCE_LEN);
    buf.read_to_end(&mut sealed)?;

    let safe_key = key.aead()?;
    let plaintext = safe_key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&token[..HEADER_LEN]),
            &mut sealed,
        )
        .map_err(|e| {
            Error::crypto(
                CryptoErrorKind::InvalidToken,
                format!("failed to open_in_place token ({:?})", e),
            )
        })?;
    Ok(plaintext.to_vec())
}

/// Encrypts data from a file and saves the token to the other file.
pub fn encrypt_file(src_file: &Path, dst_file: &Path, key: &Key) -> Result<()> {
    debug!(
        "encrypting file {} to {}",
        src_file.display(),
        dst_file.display()
    );
    let d = fs::read(src_file).map_err(|e| {
        Error::other(format!("failed read {} ({})", src_file.display(), e))
    })?;
    let token = encrypt(&d, key)?;
    fs::write(dst_file, token).map_err(|e| {
        Error::other(format!("failed write {} ({})", dst_file.display(), e))
    })?;
    Ok(())
}

/// Decrypts a token file and saves the plaintext to the other file.
/// Nothing is written when the token fails to open.
pub fn decrypt_file(src_file: &Path, dst_file: &Path, key: &Key) -> Result<()> {
    debug!(
        "decrypting file {} to {}",
        src_file.display(),
        dst_file.display()
    );
    let d = fs::read(src_file).map_err(|e| {
        Error::other(format!("failed read {} ({})", src_file.display(), e))
    })?;
    let plaintext = decrypt(&d, key)?;
    fs::write(dst_file, plaintext).map_err(|e| {
        Error::other(format!("failed write {} ({})", dst_file.display(), e))
    })?;
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[test]
fn test_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let key = generate_key().unwrap();
    for msg in [&b""[..], b"a", b"hello world", &[7u8; 4096][..]] {
        let token = encrypt(msg, &key).unwrap();
        assert_eq!(token.len(), MIN_TOKEN_LEN + msg.len());
        assert_eq!(token[0], TOKEN_VERSION);
        let plain = decrypt(&token, &key).unwrap();
        assert_eq!(plain, msg);
    }
}

#[test]
fn test_fresh_tokens() {
    let key = generate_key().unwrap();
    let t1 = encrypt(b"same input", &key).unwrap();
    let t2 = encrypt(b"same input", &key).unwrap();
    assert_ne!(t1, t2);

    let k1 = generate_key().unwrap();
    let k2 = generate_key().unwrap();
    assert_ne!(k1.as_bytes(), k2.as_bytes());
}

#[test]
fn test_tamper_every_byte() {
    let key = generate_key().unwrap();
    let token = encrypt(b"col_a,col_b\n1,2\n", &key).unwrap();

    for i in 0..token.len() {
        let mut tampered = token.clone();
        tampered[i] ^= 0x01;
        let err = decrypt(&tampered, &key).unwrap_err();
        assert_eq!(
            err.crypto_kind(),
            Some(CryptoErrorKind::InvalidToken),
            "byte {} flipped",
            i
        );
    }
}

#[test]
fn test_truncated_token() {
    let key = generate_key().unwrap();
    let token = encrypt(b"payload", &key).unwrap();

    for n in [0, 1, HEADER_LEN, MIN_TOKEN_LEN - 1, token.len() - 1] {
        let err = decrypt(&token[..n], &key).unwrap_err();
        assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidToken));
    }
}

#[test]
fn test_wrong_key() {
    let k1 = generate_key().unwrap();
    let k2 = generate_key().unwrap();
    let token = encrypt(b"secret", &k1).unwrap();
    let err = decrypt(&token, &k2).unwrap_err();
    assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidToken));
}

#[test]
fn test_malformed_key() {
    let err = Key::from_slice(&[0u8; 16]).unwrap_err();
    assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidKey));
    let err = Key::from_slice(&[]).unwrap_err();
    assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidKey));
    assert!(Key::from_slice(&[1u8; KEY_LEN]).is_ok());
}

#[test]
fn test_ttl() {
    let key = generate_key().unwrap();
    let issued = 1_700_000_000;
    let token = encrypt_at(b"short-lived", &key, issued).unwrap();

    let ttl = Some(Duration::from_secs(30));
    assert_eq!(
        decrypt_at(&token, &key, ttl, issued + 30).unwrap(),
        b"short-lived"
    );

    let err = decrypt_at(&token, &key, ttl, issued + 31).unwrap_err();
    assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::Expired));

    // stamped well ahead of the local clock
    let err = decrypt_at(&token, &key, ttl, issued - MAX_CLOCK_SKEW_SECS - 1).unwrap_err();
    assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidToken));

    // no ttl means no age check
    assert!(decrypt_at(&token, &key, None, issued + 1_000_000).is_ok());
}

#[test]
fn test_key_debug_redacted() {
    let key = Key::from_slice(&[0xab; KEY_LEN]).unwrap();
    let s = format!("{:?}", key);
    assert!(!s.contains("171"));
    assert!(s.contains("REDACTED"));
}

#[test]
fn test_file_helpers() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let src = tmp_dir.path().join("data.csv");
    let enc = tmp_dir.path().join("data.csv.encrypted");
    let dec = tmp_dir.path().join("restored.csv");
    fs::write(&src, b"id,name\n1,alpha\n").unwrap();

    let key = generate_key().unwrap();
    encrypt_file(&src, &enc, &key).unwrap();
    assert_ne!(fs::read(&enc).unwrap(), fs::read(&src).unwrap());

    let other = generate_key().unwrap();
    assert!(decrypt_file(&enc, &dec, &other).is_err());
    assert!(!dec.exists());

    decrypt_file(&enc, &dec, &key).unwrap();
    assert_eq!(fs::read(&dec).unwrap(), fs::read(&src).unwrap());
}
