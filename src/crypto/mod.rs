//! Cryptography for the exemption-verification flow.
//!
//! Provides:
//! - ED25519 key generation and storage
//! - Signed, expiring verification tokens

pub mod keys;
pub mod token;

pub use keys::*;
pub use token::*;
