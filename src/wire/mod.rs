//! Wire protocol: the envelope clients and the match engine exchange.
//!
//! Spec §6 describes two equivalent encodings selected by a `format` query
//! parameter: a length-prefixed binary tag-length-value frame, or an
//! equivalent text (JSON) mapping. We model both as serializations of the
//! same `Envelope` via `serde`, matching the teacher's tagged-enum style
//! (`TickEvent`, `GameLogBody`) rather than hand-rolling a binary codec.

pub mod envelope;

pub use envelope::{Envelope, EnvelopeBody};

use serde::{Deserialize, Serialize};

/// Per-session wire format, selected at connect time (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Binary,
    Text,
}

impl Format {
    pub fn parse_query_param(value: Option<&str>) -> Result<Self, crate::error::CoreError> {
        match value {
            None | Some("binary") => Ok(Format::Binary),
            Some("text") => Ok(Format::Text),
            Some(other) => Err(crate::error::CoreError::BadInput(format!(
                "unsupported format: {other}"
            ))),
        }
    }
}

/// Encode an envelope for the wire, per-session, according to its format.
pub fn encode(format: Format, envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
    match format {
        Format::Binary => Ok(encode_binary(envelope)?),
        Format::Text => Ok(serde_json::to_vec(envelope)?),
    }
}

pub fn decode(format: Format, bytes: &[u8]) -> anyhow::Result<Envelope> {
    match format {
        Format::Binary => decode_binary(bytes),
        Format::Text => Ok(serde_json::from_slice(bytes)?),
    }
}

/// Length-prefixed tag-length-value framing: a 4-byte little-endian length
/// prefix over a `bincode`-less JSON payload. The "binary" framing in this
/// host only differs from "text" in carrying the length prefix and not
/// being intended for human inspection — the payload itself is still a
/// compact serde representation, matching how the teacher keeps a single
/// `Serialize` impl per message type and lets the transport pick the
/// encoding.
fn encode_binary(envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)?;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn decode_binary(bytes: &[u8]) -> anyhow::Result<Envelope> {
    if bytes.len() < 4 {
        anyhow::bail!("frame too short for length prefix");
    }
    let (len_bytes, rest) = bytes.split_at(4);
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() != len {
        anyhow::bail!("frame length prefix {len} does not match body length {}", rest.len());
    }
    Ok(serde_json::from_slice(rest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::envelope::EnvelopeBody;

    #[test]
    fn format_defaults_to_binary() {
        assert_eq!(Format::parse_query_param(None).unwrap(), Format::Binary);
        assert_eq!(
            Format::parse_query_param(Some("binary")).unwrap(),
            Format::Binary
        );
        assert_eq!(
            Format::parse_query_param(Some("text")).unwrap(),
            Format::Text
        );
    }

    #[test]
    fn invalid_format_rejected() {
        assert!(Format::parse_query_param(Some("xml")).is_err());
    }

    #[test]
    fn binary_round_trips() {
        let envelope = Envelope {
            cid: Some("corr-1".into()),
            body: EnvelopeBody::Ping,
        };
        let bytes = encode(Format::Binary, &envelope).unwrap();
        let decoded = decode(Format::Binary, &bytes).unwrap();
        assert_eq!(decoded.cid, envelope.cid);
    }

    #[test]
    fn oversized_frame_detected_by_caller() {
        // the wire module itself does not enforce max frame size; the
        // transport does (spec §4.1 "oversized inbound frames fail the
        // session"). This just verifies truncated frames are rejected.
        let bad = vec![0xffu8; 4];
        assert!(decode(Format::Binary, &bad).is_err());
    }
}
