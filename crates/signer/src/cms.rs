//! Gateway batch signatures.
//!
//! The gateway expects a base64-encoded, detached CMS `SignedData` over the
//! batch signing record, signed with the certificate registered for upload
//! and carrying a signing-time attribute.

use crate::error::{SignerError, SignerResult};
use crate::key;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use cms::builder::{SignedDataBuilder, SignerInfoBuilder, create_signing_time_attribute};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::ContentInfo;
use cms::signed_data::{EncapsulatedContentInfo, SignerIdentifier};
use const_oid::db::rfc5911::ID_DATA;
use const_oid::db::rfc5912::ID_SHA_256;
use der::{DecodePem, Encode};
use keyrelay_core::config::CertificateConfig;
use p256::ecdsa::signature::{Keypair, Signer};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use sha2::{Digest, Sha256};
use spki::{
    AlgorithmIdentifierOwned, DynSignatureAlgorithmIdentifier, EncodePublicKey,
    SignatureBitStringEncoding,
};
use std::fmt;
use x509_cert::Certificate;

enum BatchSigningKey {
    Rsa(rsa::pkcs1v15::SigningKey<Sha256>),
    Ecdsa(p256::ecdsa::SigningKey),
}

/// Signs gateway upload batches with a certificate and its private key.
pub struct GatewayBatchSigner {
    certificate: Certificate,
    key: BatchSigningKey,
}

impl GatewayBatchSigner {
    /// Create from a PEM certificate and a PEM RSA or P-256 private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> SignerResult<Self> {
        let certificate = Certificate::from_pem(cert_pem)
            .map_err(|e| SignerError::Certificate(e.to_string()))?;
        Ok(Self {
            certificate,
            key: parse_signing_key(key_pem)?,
        })
    }

    /// Load from the configured certificate and key sources.
    pub fn from_config(config: &CertificateConfig) -> SignerResult<Self> {
        let cert = config
            .cert
            .resolve()?
            .ok_or_else(|| SignerError::Certificate("signing certificate is required".to_string()))?;
        let key = config
            .key
            .resolve()?
            .ok_or_else(|| SignerError::KeyParsing("signing key is required".to_string()))?;
        Self::from_pem(&cert, &key)
    }

    /// DER-encoded detached `ContentInfo` over `content`.
    pub fn sign_detached(&self, content: &[u8]) -> SignerResult<Vec<u8>> {
        let eci = EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        };
        let digest = Sha256::digest(content);

        let content_info = match &self.key {
            BatchSigningKey::Rsa(key) => {
                self.build::<_, rsa::pkcs1v15::Signature>(key, &eci, &digest)?
            }
            BatchSigningKey::Ecdsa(key) => {
                self.build::<_, p256::ecdsa::DerSignature>(key, &eci, &digest)?
            }
        };

        content_info
            .to_der()
            .map_err(|e| SignerError::Signing(format!("failed to encode SignedData: {e}")))
    }

    /// Base64 of [`sign_detached`](Self::sign_detached), the form sent in the
    /// `batchSignature` header.
    pub fn batch_signature(&self, content: &[u8]) -> SignerResult<String> {
        Ok(STANDARD.encode(self.sign_detached(content)?))
    }

    fn build<S, Sig>(
        &self,
        key: &S,
        eci: &EncapsulatedContentInfo,
        digest: &[u8],
    ) -> SignerResult<ContentInfo>
    where
        S: Keypair + DynSignatureAlgorithmIdentifier + Signer<Sig>,
        S::VerifyingKey: EncodePublicKey,
        Sig: SignatureBitStringEncoding,
    {
        let digest_algorithm = AlgorithmIdentifierOwned {
            oid: ID_SHA_256,
            parameters: None,
        };
        let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: self.certificate.tbs_certificate.issuer.clone(),
            serial_number: self.certificate.tbs_certificate.serial_number.clone(),
        });

        let mut signer_info =
            SignerInfoBuilder::new(key, sid, digest_algorithm.clone(), eci, Some(digest))
                .map_err(builder_error)?;
        signer_info
            .add_signed_attribute(create_signing_time_attribute().map_err(builder_error)?)
            .map_err(builder_error)?;

        SignedDataBuilder::new(eci)
            .add_digest_algorithm(digest_algorithm)
            .map_err(builder_error)?
            .add_certificate(CertificateChoices::Certificate(self.certificate.clone()))
            .map_err(builder_error)?
            .add_signer_info::<S, Sig>(signer_info)
            .map_err(builder_error)?
            .build()
            .map_err(builder_error)
    }
}

fn builder_error(err: cms::builder::Error) -> SignerError {
    SignerError::Signing(format!("failed to build SignedData: {err}"))
}

fn parse_signing_key(pem: &str) -> SignerResult<BatchSigningKey> {
    let rsa = RsaPrivateKey::from_pkcs8_pem(pem)
        .ok()
        .or_else(|| RsaPrivateKey::from_pkcs1_pem(pem).ok());
    if let Some(rsa) = rsa {
        return Ok(BatchSigningKey::Rsa(rsa::pkcs1v15::SigningKey::<Sha256>::new(rsa)));
    }
    key::parse_ec_private_key(pem)
        .map(BatchSigningKey::Ecdsa)
        .map_err(|_| SignerError::KeyParsing("expected an RSA or P-256 PEM private key".to_string()))
}

impl fmt::Debug for GatewayBatchSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.key {
            BatchSigningKey::Rsa(_) => "rsa",
            BatchSigningKey::Ecdsa(_) => "ecdsa-p256",
        };
        f.debug_struct("GatewayBatchSigner")
            .field("subject", &self.certificate.tbs_certificate.subject.to_string())
            .field("algorithm", &algorithm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms::signed_data::{SignedData, SignerInfo};
    use const_oid::db::rfc5911::{ID_MESSAGE_DIGEST, ID_SIGNING_TIME};
    use const_oid::db::rfc5912::{ECDSA_WITH_SHA_256, SHA_256_WITH_RSA_ENCRYPTION};
    use der::Decode;
    use der::asn1::OctetString;

    const RSA_CERT: &str = include_str!("../tests/fixtures/gateway-rsa.crt");
    const RSA_KEY: &str = include_str!("../tests/fixtures/gateway-rsa.key");

    fn parse(der: &[u8]) -> (SignedData, SignerInfo) {
        let content_info = ContentInfo::from_der(der).unwrap();
        let signed_data: SignedData = content_info.content.decode_as().unwrap();
        let signer_info = signed_data.signer_infos.0.iter().next().unwrap().clone();
        (signed_data, signer_info)
    }

    fn message_digest(signer_info: &SignerInfo) -> Vec<u8> {
        let attrs = signer_info.signed_attrs.as_ref().unwrap();
        let attr = attrs.iter().find(|a| a.oid == ID_MESSAGE_DIGEST).unwrap();
        let value: OctetString = attr.values.iter().next().unwrap().decode_as().unwrap();
        value.as_bytes().to_vec()
    }

    #[test]
    fn ecdsa_signature_is_detached_and_verifies() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["efgs-signing.test".to_string()]).unwrap();
        let key_pem = key_pair.serialize_pem();
        let signer = GatewayBatchSigner::from_pem(&cert.pem(), &key_pem).unwrap();

        let content = b"AAECAwQFBgcICQoLDA0ODw==.AChwkA==.";
        let der = signer.sign_detached(content).unwrap();
        let (signed_data, signer_info) = parse(&der);

        assert!(signed_data.encap_content_info.econtent.is_none());
        assert_eq!(signed_data.certificates.as_ref().unwrap().0.len(), 1);
        assert_eq!(signer_info.signature_algorithm.oid, ECDSA_WITH_SHA_256);
        assert_eq!(message_digest(&signer_info), Sha256::digest(content).to_vec());

        let attrs = signer_info.signed_attrs.as_ref().unwrap();
        assert!(attrs.iter().any(|a| a.oid == ID_SIGNING_TIME));

        use p256::ecdsa::signature::Verifier;
        let verifying_key = *key::parse_ec_private_key(&key_pem).unwrap().verifying_key();
        let signature =
            p256::ecdsa::Signature::from_der(signer_info.signature.as_bytes()).unwrap();
        verifying_key
            .verify(&attrs.to_der().unwrap(), &signature)
            .unwrap();
    }

    #[test]
    fn rsa_signature_verifies() {
        let signer = GatewayBatchSigner::from_pem(RSA_CERT, RSA_KEY).unwrap();
        let content = b"record-one.record-two.";
        let der = signer.sign_detached(content).unwrap();
        let (_, signer_info) = parse(&der);

        assert_eq!(
            signer_info.signature_algorithm.oid,
            SHA_256_WITH_RSA_ENCRYPTION
        );
        assert_eq!(message_digest(&signer_info), Sha256::digest(content).to_vec());

        use rsa::signature::Verifier;
        let public = RsaPrivateKey::from_pkcs8_pem(RSA_KEY).unwrap().to_public_key();
        let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public);
        let signature =
            rsa::pkcs1v15::Signature::try_from(signer_info.signature.as_bytes()).unwrap();
        let attrs = signer_info.signed_attrs.as_ref().unwrap();
        verifying_key
            .verify(&attrs.to_der().unwrap(), &signature)
            .unwrap();
    }

    #[test]
    fn batch_signature_is_base64() {
        let signer = GatewayBatchSigner::from_pem(RSA_CERT, RSA_KEY).unwrap();
        let encoded = signer.batch_signature(b"content").unwrap();
        let der = STANDARD.decode(encoded).unwrap();
        assert!(ContentInfo::from_der(&der).is_ok());
    }

    #[test]
    fn rejects_unknown_key() {
        let err = GatewayBatchSigner::from_pem(RSA_CERT, "not a key").unwrap_err();
        assert!(matches!(err, SignerError::KeyParsing(_)));

        let err = GatewayBatchSigner::from_pem("not a cert", RSA_KEY).unwrap_err();
        assert!(matches!(err, SignerError::Certificate(_)));
    }
}
