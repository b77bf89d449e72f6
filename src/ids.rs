//! 128-bit time-ordered identifiers.
//!
//! Every entity id in the core (session, match, ticket, channel message,
//! presence) is a UUIDv7 so ids sort by creation time without a separate
//! sequence column. Match ids additionally carry a node tag (spec §6).

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::CoreError;

pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

pub type SessionId = Uuid;
pub type UserId = Uuid;
pub type TicketId = Uuid;

/// `<uuid>.<node>` — node is empty for relayed matches, non-empty for
/// authoritative matches (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MatchId {
    pub id: Uuid,
    pub node: String,
}

impl MatchId {
    pub fn new_authoritative(node: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            node: node.into(),
        }
    }

    pub fn new_relayed() -> Self {
        Self {
            id: new_id(),
            node: String::new(),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        !self.node.is_empty()
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.node)
    }
}

impl FromStr for MatchId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id_part, node_part) = s
            .split_once('.')
            .ok_or_else(|| CoreError::BadInput(format!("malformed match id: {s}")))?;
        let id = Uuid::parse_str(id_part)
            .map_err(|e| CoreError::BadInput(format!("malformed match id uuid: {e}")))?;
        Ok(Self {
            id,
            node: node_part.to_string(),
        })
    }
}
