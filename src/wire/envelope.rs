//! The typed envelope carrying a correlation id and a message oneof
//! (spec §6).

use serde::{Deserialize, Serialize};

use crate::ids::MatchId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id set by the client on requests; echoed back on the
    /// matching response so callers can pair async replies.
    pub cid: Option<String>,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Ping,
    Pong,

    /// Raw match data, forwarded to/from the authoritative or relayed match
    /// loop untouched (spec §3 "MatchData message").
    MatchData {
        match_id: MatchId,
        op_code: i64,
        payload: Vec<u8>,
        reliable: bool,
        /// present on inbound frames the router forwarded to the match's
        /// queue; absent on ones the sender is about to send.
        sender_session_id: Option<uuid::Uuid>,
    },

    /// A channel chat message delivered to a stream (spec §4.4).
    ChannelMessage {
        stream_mode: u8,
        subject: String,
        subcontext: String,
        label: String,
        content: String,
    },

    /// Generic notification payload used for the Notifications stream.
    Notification { code: i32, subject: String, content: String },

    Error { code: i32, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_serialize_with_tag() {
        let json = serde_json::to_string(&EnvelopeBody::Ping).unwrap();
        assert!(json.contains("\"kind\":\"ping\""));
    }
}
