//! At-rest encryption for the AI provider credential stored in the
//! settings table. AES-256-GCM with a PBKDF2-derived key; the payload is
//! `enc:<salt>:<nonce>:<ciphertext>` in base64.

use base64::{engine::general_purpose, Engine as _};
use ring::{
    aead, pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use std::num::NonZeroU32;

use crate::error::{PipelineError, Result};

const APP_SECRET: &[u8] = b"invox-secret-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

pub fn encrypt_api_key(api_key: &str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| PipelineError::Configuration("failed to generate salt".into()))?;

    let key = derive_key(&salt)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| PipelineError::Configuration("failed to generate nonce".into()))?;

    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
    let mut in_out = api_key.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| PipelineError::Configuration("encryption failed".into()))?;

    Ok(format!(
        "enc:{}:{}:{}",
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(nonce_bytes),
        general_purpose::STANDARD.encode(in_out)
    ))
}

pub fn decrypt_api_key(encrypted: &str) -> Result<String> {
    let parts: Vec<&str> = encrypted.split(':').collect();
    if parts.len() != 4 || parts[0] != "enc" {
        return Err(PipelineError::Configuration(
            "unknown encrypted credential format".into(),
        ));
    }
    let salt = decode_part(parts[1], "salt")?;
    let nonce_bytes = decode_part(parts[2], "nonce")?;
    let mut data = decode_part(parts[3], "ciphertext")?;

    let key = derive_key(&salt)?;
    let nonce = aead::Nonce::assume_unique_for_key(
        nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| PipelineError::Configuration("invalid nonce length".into()))?,
    );

    let decrypted = key
        .open_in_place(nonce, aead::Aad::empty(), &mut data)
        .map_err(|_| PipelineError::Configuration("decryption failed".into()))?;
    String::from_utf8(decrypted.to_vec())
        .map_err(|_| PipelineError::Configuration("decrypted credential is not UTF-8".into()))
}

fn decode_part(part: &str, what: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(part)
        .map_err(|e| PipelineError::Configuration(format!("decode {what}: {e}")))
}

fn derive_key(salt: &[u8]) -> Result<aead::LessSafeKey> {
    let mut key_bytes = [0u8; 32];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
        .ok_or_else(|| PipelineError::Configuration("invalid iteration count".into()))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        APP_SECRET,
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| PipelineError::Configuration("invalid key material".into()))?;
    Ok(aead::LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let encrypted = encrypt_api_key("AIza-test-key").unwrap();
        assert!(encrypted.starts_with("enc:"));
        assert_eq!(decrypt_api_key(&encrypted).unwrap(), "AIza-test-key");
    }

    #[test]
    fn rejects_garbage() {
        assert!(decrypt_api_key("keychain:whatever").is_err());
        assert!(decrypt_api_key("enc:only-two").is_err());
    }
}
