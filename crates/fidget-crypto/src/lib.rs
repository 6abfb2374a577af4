//! Cryptographic primitives for Smart Fidget payloads.
//!
//! This crate provides:
//! - The symmetric device key shared with the fidget during provisioning
//! - Cipher key derivation and AES-256-CBC entry decryption
//! - Per-payload batch decryption with success tracking
//!
//! # Design
//!
//! Every encrypted entry is a hex string: a 16-byte IV followed by the
//! ciphertext. The cipher key is `SHA-256(phrase || key bytes)`. Two phrases
//! are in use across firmware revisions, so decryption tries the configured
//! secret phrase first and the legacy shared phrase second.

#![forbid(unsafe_code)]

pub mod batch;
pub mod decrypt;
pub mod symmetric;

pub use batch::{DecryptedBatch, PayloadDecryptor, INCOMPATIBLE_PAYLOAD};
pub use decrypt::{decrypt_entry, DecryptError, DecryptionFailure, KeyDerivation};
pub use symmetric::{KeyError, SymmetricKey};
