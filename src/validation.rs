//! Input validation for operator commands and mesh-originated text.

use thiserror::Error;

use crate::mesh::PUB_KEY_SIZE;
use crate::server::MAX_POST_TEXT_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("text is empty")]
    Empty,
    #[error("text exceeds {MAX_POST_TEXT_LEN} characters")]
    TooLong,
    #[error("invalid public key hex")]
    BadHex,
    #[error("value out of range")]
    OutOfRange,
}

/// Post/bulletin body: non-empty and within the length limit (severity
/// prefixes are added on top of this).
pub fn validate_post_text(text: &str) -> Result<(), ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty);
    }
    if text.len() > MAX_POST_TEXT_LEN {
        return Err(ValidationError::TooLong);
    }
    Ok(())
}

/// Parse a hex public-key prefix: even length, at most a full key.
pub fn parse_pubkey_prefix(hex_str: &str) -> Result<Vec<u8>, ValidationError> {
    if hex_str.is_empty() || hex_str.len() % 2 != 0 || hex_str.len() > PUB_KEY_SIZE * 2 {
        return Err(ValidationError::BadHex);
    }
    hex::decode(hex_str).map_err(|_| ValidationError::BadHex)
}
