//! Credential vault: encryption of the broker secret and its file store

pub mod store;
pub mod vault;

use crate::protocol::messages::ErrorCode;
use thiserror::Error;

pub use store::{CredentialStatus, CredentialStore};
pub use vault::{decrypt, derive_key, encrypt, DerivedKey, VaultKey};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Stored credential is corrupt: {0}")]
    Corrupt(String),
    #[error("No stored credential found")]
    Missing,
    #[error("Credential storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CredentialError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CredentialError::Corrupt(_) => ErrorCode::CredentialCorrupt,
            CredentialError::Missing => ErrorCode::CredentialMissing,
            CredentialError::Io(_) => ErrorCode::InternalError,
        }
    }
}
