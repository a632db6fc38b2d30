//! Signing for keyrelay.
//!
//! This crate provides:
//! - ECDSA P-256 signatures over export archives (`export.sig`)
//! - ES256 compact JWS payloads for peer server uploads
//! - Detached CMS SignedData batch signatures for the gateway

pub mod cms;
pub mod error;
pub mod export;
pub mod jws;
pub mod key;

pub use cms::GatewayBatchSigner;
pub use error::{SignerError, SignerResult};
pub use export::ExportSigner;
pub use jws::PeerPayloadSigner;
