//! At-rest encryption of env variable values and other secrets,
//! keyed by the 32 raw bytes mounted at the swarm secret path.
//!
//! Ciphertext format: base64(nonce || aes-256-gcm ciphertext).

use std::sync::OnceLock;

use aes_gcm::{
  Aes256Gcm, Key, Nonce,
  aead::{Aead, KeyInit},
};
use anyhow::{Context, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;

use crate::config::core_config;

const NONCE_LEN: usize = 12;

fn cipher() -> anyhow::Result<&'static Aes256Gcm> {
  static CIPHER: OnceLock<Option<Aes256Gcm>> = OnceLock::new();
  CIPHER
    .get_or_init(|| {
      let path = &core_config().encryption_key_path;
      let key_bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
          error!("failed to read encryption key at {path:?} | {e}");
          return None;
        }
      };
      if key_bytes.len() != 32 {
        error!(
          "encryption key at {path:?} is {} bytes, expected 32",
          key_bytes.len()
        );
        return None;
      }
      Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)))
    })
    .as_ref()
    .context("encryption key unavailable")
}

pub fn encrypt(plaintext: &str) -> anyhow::Result<String> {
  encrypt_with(cipher()?, plaintext)
}

pub fn decrypt(encoded: &str) -> anyhow::Result<String> {
  decrypt_with(cipher()?, encoded)
}

/// None passes through unchanged on both sides.
pub fn encrypt_optional(
  plaintext: Option<&str>,
) -> anyhow::Result<Option<String>> {
  plaintext.map(encrypt).transpose()
}

pub fn decrypt_optional(
  encoded: Option<&str>,
) -> anyhow::Result<Option<String>> {
  encoded.map(decrypt).transpose()
}

fn encrypt_with(
  cipher: &Aes256Gcm,
  plaintext: &str,
) -> anyhow::Result<String> {
  let mut nonce_bytes = [0u8; NONCE_LEN];
  rand::rng().fill_bytes(&mut nonce_bytes);
  let nonce = Nonce::from_slice(&nonce_bytes);
  let ciphertext = cipher
    .encrypt(nonce, plaintext.as_bytes())
    .map_err(|_| anyhow!("encryption failed"))?;
  let mut combined = nonce_bytes.to_vec();
  combined.extend(ciphertext);
  Ok(STANDARD.encode(combined))
}

fn decrypt_with(
  cipher: &Aes256Gcm,
  encoded: &str,
) -> anyhow::Result<String> {
  let combined = STANDARD
    .decode(encoded)
    .context("ciphertext is not valid base64")?;
  if combined.len() < NONCE_LEN {
    return Err(anyhow!("ciphertext too short"));
  }
  let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
  let plaintext = cipher
    .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
    .map_err(|_| anyhow!("decryption failed"))?;
  String::from_utf8(plaintext)
    .context("decrypted value is not UTF-8")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_cipher() -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[7u8; 32]))
  }

  #[test]
  fn round_trips() {
    let cipher = test_cipher();
    let secret = "postgres://user:hunter2@db:5432/app";
    let ciphertext = encrypt_with(&cipher, secret).unwrap();
    assert_ne!(ciphertext, secret);
    assert_eq!(decrypt_with(&cipher, &ciphertext).unwrap(), secret);
  }

  #[test]
  fn ciphertexts_are_nonce_randomized() {
    let cipher = test_cipher();
    let a = encrypt_with(&cipher, "same value").unwrap();
    let b = encrypt_with(&cipher, "same value").unwrap();
    assert_ne!(a, b);
    assert_eq!(
      decrypt_with(&cipher, &a).unwrap(),
      decrypt_with(&cipher, &b).unwrap()
    );
  }

  #[test]
  fn tampered_ciphertext_is_rejected() {
    let cipher = test_cipher();
    let ciphertext = encrypt_with(&cipher, "value").unwrap();
    let mut bytes = STANDARD.decode(&ciphertext).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    assert!(
      decrypt_with(&cipher, &STANDARD.encode(bytes)).is_err()
    );
  }

  #[test]
  fn wrong_key_is_rejected() {
    let ciphertext =
      encrypt_with(&test_cipher(), "value").unwrap();
    let other =
      Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[8u8; 32]));
    assert!(decrypt_with(&other, &ciphertext).is_err());
  }
}
