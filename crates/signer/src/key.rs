//! P-256 private key loading.

use crate::error::{SignerError, SignerResult};
use keyrelay_core::config::KeySource;
use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;

/// Parse a P-256 private key from PEM, accepting PKCS#8 (`PRIVATE KEY`)
/// and SEC1 (`EC PRIVATE KEY`) encodings.
pub fn parse_ec_private_key(pem: &str) -> SignerResult<SigningKey> {
    if let Ok(key) = SigningKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    let secret = p256::SecretKey::from_sec1_pem(pem)
        .map_err(|e| SignerError::KeyParsing(format!("expected a P-256 PEM private key: {e}")))?;
    Ok(SigningKey::from(secret))
}

/// Generate a fresh random P-256 key.
pub fn generate_ec_key() -> SigningKey {
    SigningKey::random(&mut rand_core::OsRng)
}

/// Load a P-256 key from a configured source, generating a throwaway key for
/// [`KeySource::Generate`].
pub fn load_ec_key(source: &KeySource, purpose: &str) -> SignerResult<SigningKey> {
    match source.resolve()? {
        Some(pem) => parse_ec_private_key(&pem),
        None => {
            tracing::warn!(
                purpose = purpose,
                "Using a generated signing key; signatures will not verify against any published key"
            );
            Ok(generate_ec_key())
        }
    }
}
