//! Export archive signing.
//!
//! `export.sig` carries an ECDSA P-256 / SHA-256 signature over the bytes of
//! `export.bin`, DER-encoded as the exposure notification frameworks expect.

use crate::error::{SignerError, SignerResult};
use crate::key;
use keyrelay_core::config::KeySource;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{DerSignature, SigningKey, VerifyingKey};
use p256::pkcs8::{EncodePublicKey, LineEnding};
use std::fmt;

/// Signs export payloads with the deployment's export key.
pub struct ExportSigner {
    key: SigningKey,
}

impl ExportSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Load from a configured key source.
    pub fn from_source(source: &KeySource) -> SignerResult<Self> {
        key::load_ec_key(source, "export").map(Self::new)
    }

    /// Create from a PEM private key (PKCS#8 or SEC1).
    pub fn from_pem(pem: &str) -> SignerResult<Self> {
        key::parse_ec_private_key(pem).map(Self::new)
    }

    /// Generate a signer with a random key.
    pub fn generate() -> Self {
        Self::new(key::generate_ec_key())
    }

    /// DER-encoded ECDSA signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: DerSignature = self.key.sign(data);
        signature.as_bytes().to_vec()
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }

    /// SPKI PEM of the verification key, as published to the app platforms.
    pub fn public_key_pem(&self) -> SignerResult<String> {
        self.key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SignerError::KeyParsing(format!("failed to encode public key: {e}")))
    }
}

impl fmt::Debug for ExportSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExportSigner([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::Signature;
    use p256::ecdsa::signature::Verifier;

    #[test]
    fn signature_verifies_against_public_key() {
        let signer = ExportSigner::generate();
        let data = b"EK Export v1    payload";

        let der = signer.sign(data);
        let signature = Signature::from_der(&der).unwrap();
        assert!(signer.verifying_key().verify(data, &signature).is_ok());
        assert!(
            signer
                .verifying_key()
                .verify(b"tampered", &signature)
                .is_err()
        );
    }

    #[test]
    fn loads_sec1_fixture() {
        let pem = include_str!("../tests/fixtures/export-sec1.key");
        let signer = ExportSigner::from_pem(pem).unwrap();
        assert!(
            signer
                .public_key_pem()
                .unwrap()
                .starts_with("-----BEGIN PUBLIC KEY-----")
        );
    }

    #[test]
    fn debug_redacts_key() {
        let signer = ExportSigner::generate();
        assert_eq!(format!("{signer:?}"), "ExportSigner([REDACTED])");
    }
}
