//! Opaque URL-safe base64-encoded cursor helper shared by Channel Messaging
//! and the Leaderboard Engine (spec §9 "Cursors as opaque tokens").
//!
//! Each subsystem defines its own cursor payload struct (it must carry
//! every field the query needs in order to reject cursor reuse across a
//! different filter) and uses [`encode`]/[`decode`] here for the actual
//! base64 framing + JSON payload, the same "fixed binary encoding,
//! self-describing" shape spec §9 calls for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::CoreError;

pub fn encode<T: Serialize>(payload: &T) -> String {
    let bytes = serde_json::to_vec(payload).expect("cursor payload must serialize");
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode<T: DeserializeOwned>(cursor: &str) -> Result<T, CoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| CoreError::InvalidCursor(format!("not valid base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::InvalidCursor(format!("malformed cursor payload: {e}")))
}
