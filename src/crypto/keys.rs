//! ED25519 key management for verification tokens.
//!
//! - Generates a keypair on first run
//! - Stores the private key base64-encoded in the key directory (0600 on unix)
//! - Stores the public key next to it for sharing

use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PRIVATE_KEY_FILE: &str = "signing_key";
const PUBLIC_KEY_FILE: &str = "public_key.txt";

/// Key manager for ED25519 signing operations.
pub struct KeyManager {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    dir: PathBuf,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("public_key", &self.public_key_base64())
            .field("dir", &self.dir)
            .finish()
    }
}

impl KeyManager {
    /// Loads the keypair stored in `dir`, or generates and stores a new one.
    pub fn load_or_generate(dir: &Path) -> Result<Self, KeyError> {
        match Self::load_private_key(dir) {
            Ok(signing_key) => {
                tracing::info!(dir = %dir.display(), "Loaded existing ED25519 keypair");
                Ok(Self::from_signing_key(signing_key, dir))
            }
            Err(KeyError::NotFound) => {
                tracing::info!("No existing keypair found, generating new one");
                Self::generate_new(dir)
            }
            Err(e) => Err(e),
        }
    }

    /// Keypair that lives only in memory.
    pub fn ephemeral() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng), Path::new(""))
    }

    fn from_signing_key(signing_key: SigningKey, dir: &Path) -> Self {
        Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
            dir: dir.to_path_buf(),
        }
    }

    fn generate_new(dir: &Path) -> Result<Self, KeyError> {
        let manager = Self::from_signing_key(SigningKey::generate(&mut OsRng), dir);
        manager.store_private_key()?;
        manager.store_public_key()?;
        tracing::info!(dir = %dir.display(), "Generated and stored new ED25519 keypair");
        Ok(manager)
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Get public key as base64 string.
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.verifying_key.as_bytes())
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_FILE)
    }

    fn load_private_key(dir: &Path) -> Result<SigningKey, KeyError> {
        let path = dir.join(PRIVATE_KEY_FILE);
        let encoded = match std::fs::read_to_string(&path) {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(KeyError::NotFound),
            Err(e) => return Err(KeyError::FileSystem(e.to_string())),
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let key_bytes: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidKey("Invalid key size".into()))?;

        Ok(SigningKey::from_bytes(&key_bytes))
    }

    fn store_private_key(&self) -> Result<(), KeyError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| KeyError::FileSystem(e.to_string()))?;

        let path = self.dir.join(PRIVATE_KEY_FILE);
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.signing_key.to_bytes());
        std::fs::write(&path, encoded).map_err(|e| KeyError::FileSystem(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| KeyError::FileSystem(e.to_string()))?;
        }
        Ok(())
    }

    /// Store public key to file for sharing.
    fn store_public_key(&self) -> Result<(), KeyError> {
        let path = self.public_key_path();
        std::fs::write(&path, self.public_key_base64())
            .map_err(|e| KeyError::FileSystem(e.to_string()))?;

        tracing::info!("Public key stored at: {}", path.display());
        Ok(())
    }
}

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key not found")]
    NotFound,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("file system error: {0}")]
    FileSystem(String),
}
