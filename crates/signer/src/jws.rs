//! Compact JWS payloads for peer server uploads.

use crate::error::{SignerError, SignerResult};
use crate::key;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use keyrelay_core::config::KeySource;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey;
use serde::Serialize;
use std::fmt;

/// Wraps outbound key lists in an ES256 compact JWS.
pub struct PeerPayloadSigner {
    key: EncodingKey,
}

impl PeerPayloadSigner {
    pub fn new(key: &SigningKey) -> SignerResult<Self> {
        let der = key
            .to_pkcs8_der()
            .map_err(|e| SignerError::KeyParsing(format!("failed to encode key: {e}")))?;
        Ok(Self {
            key: EncodingKey::from_ec_der(der.as_bytes()),
        })
    }

    /// Load from a configured key source.
    pub fn from_source(source: &KeySource) -> SignerResult<Self> {
        Self::new(&key::load_ec_key(source, "interop upload")?)
    }

    /// Create from a PEM private key (PKCS#8 or SEC1).
    pub fn from_pem(pem: &str) -> SignerResult<Self> {
        Self::new(&key::parse_ec_private_key(pem)?)
    }

    /// Serialize `payload` as JSON and sign it.
    pub fn sign<T: Serialize>(&self, payload: &T) -> SignerResult<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.typ = None;
        jsonwebtoken::encode(&header, payload, &self.key)
            .map_err(|e| SignerError::Signing(format!("failed to sign payload: {e}")))
    }
}

impl fmt::Debug for PeerPayloadSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPayloadSigner([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use jsonwebtoken::DecodingKey;
    use keyrelay_core::{ExposureKey, KeyData, PeerKey};
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    #[test]
    fn compact_jws_carries_key_list() {
        let signing_key = key::generate_ec_key();
        let signer = PeerPayloadSigner::new(&signing_key).unwrap();

        let exposure = ExposureKey::local(
            KeyData::from_bytes(&[3u8; 16]).unwrap(),
            2_650_000,
            vec!["IE".to_string()],
        );
        let payload = vec![PeerKey::from_exposure(&exposure)];
        let token = signer.sign(&payload).unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");

        let body: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(body[0]["keyData"], exposure.key_data.to_base64());
        assert_eq!(body[0]["rollingStartNumber"], 2_650_000);
        assert_eq!(body[0]["regions"][0], "IE");

        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let decoding_key = DecodingKey::from_ec_pem(public_pem.as_bytes()).unwrap();
        let message = format!("{}.{}", parts[0], parts[1]);
        assert!(
            jsonwebtoken::crypto::verify(
                parts[2],
                message.as_bytes(),
                &decoding_key,
                Algorithm::ES256
            )
            .unwrap()
        );
    }
}
