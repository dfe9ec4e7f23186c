use thiserror::Error;

use crate::types::CdcEvent;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("undecodable payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a raw message payload into a structured CDC event.
///
/// Malformed payloads will never become valid, so callers dead-letter
/// them with the original bytes instead of retrying. Semantic checks
/// (enum membership, timestamps, schemas) belong to the validator.
pub fn parse_event(payload: &[u8]) -> Result<CdcEvent, ParseError> {
    Ok(serde_json::from_slice(payload)?)
}
