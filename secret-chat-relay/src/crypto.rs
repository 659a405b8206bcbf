//! Public-key sealing for direct messages.
//!
//! Every client owns a long-lived X25519 key pair and publishes the public
//! half when it registers. To send a direct message, the sender generates a
//! throwaway X25519 key, agrees a shared secret with the recipient's public
//! key, stretches it with HKDF-SHA256 and encrypts with ChaCha20-Poly1305.
//! The sealed box on the wire is
//!
//! ```text
//! base64( ephemeral_public[32] || nonce[12] || ciphertext || tag[16] )
//! ```
//!
//! Only the matching secret key reproduces the symmetric key, and the AEAD
//! tag turns a wrong key or a tampered box into an error instead of garbage
//! plaintext. There is no sender authentication and no forward secrecy for
//! the recipient's long-lived key.

use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const HKDF_INFO: &[u8] = b"secret-chat-relay sealed message v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key is not valid base64")]
    KeyEncoding(#[source] base64::DecodeError),
    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("ciphertext is not valid base64")]
    CiphertextEncoding(#[source] base64::DecodeError),
    #[error("ciphertext is too short to be a sealed message")]
    Truncated,
    #[error("key agreement with this public key is not safe")]
    WeakKey,
    #[error("could not derive a message key")]
    KeyDerivation,
    #[error("encryption failed")]
    Encryption,
    #[error("message was not sealed for this key or has been altered")]
    Authentication,
    #[error("decrypted message is not valid UTF-8")]
    NotUtf8,
}

/// The client's own X25519 identity.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Loads the base64 secret key stored at `path`, or generates a fresh
    /// one and writes it there.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = fs::read_to_string(path)
                .with_context(|| format!("failed to read key file {}", path.display()))?;
            let bytes = decode_key(encoded.trim())
                .with_context(|| format!("key file {} is corrupt", path.display()))?;
            return Ok(Self::from_secret_bytes(bytes));
        }

        let keys = Self::generate();
        write_secret(path, &STANDARD.encode(keys.secret.to_bytes()))
            .with_context(|| format!("failed to write key file {}", path.display()))?;
        Ok(keys)
    }

    /// Base64 of the raw public key, as published to the relay.
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let bytes = STANDARD
            .decode(sealed.trim())
            .map_err(CryptoError::CiphertextEncoding)?;
        if bytes.len() < KEY_LENGTH + NONCE_LENGTH + TAG_LENGTH {
            return Err(CryptoError::Truncated);
        }

        let (ephemeral, rest) = bytes.split_at(KEY_LENGTH);
        let (nonce, ciphertext) = rest.split_at(NONCE_LENGTH);

        let mut ephemeral_bytes = [0u8; KEY_LENGTH];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let shared = self.secret.diffie_hellman(&ephemeral_public);
        let cipher = message_cipher(&shared, &ephemeral_public, &self.public)?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }
}

/// Seals `plaintext` so only the owner of `recipient_public_key` can read it.
pub fn seal(recipient_public_key: &str, plaintext: &str) -> Result<String, CryptoError> {
    let recipient = PublicKey::from(decode_key(recipient_public_key)?);

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let cipher = message_cipher(&shared, &ephemeral_public, &recipient)?;

    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(KEY_LENGTH + NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(sealed))
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let bytes = STANDARD.decode(encoded).map_err(CryptoError::KeyEncoding)?;
    <[u8; KEY_LENGTH]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::KeyLength(bytes.len()))
}

fn message_cipher(
    shared: &SharedSecret,
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> Result<ChaCha20Poly1305, CryptoError> {
    // Low-order points collapse the shared secret to a known value.
    if !shared.was_contributory() {
        return Err(CryptoError::WeakKey);
    }

    let mut salt = [0u8; KEY_LENGTH * 2];
    salt[..KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    salt[KEY_LENGTH..].copy_from_slice(recipient_public.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut key = [0u8; KEY_LENGTH];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}

fn write_secret(path: &Path, encoded: &str) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(encoded.as_bytes())?;
    file.write_all(b"\n")
}
