//! The match handler contract (spec §4.2): seven user-supplied functions
//! hosted on a fixed-rate scheduler, one task per match.

use serde_json::Value as Json;

use crate::ids::SessionId;
use crate::presence::Presence;

/// What `init` returns on success: the handler's chosen tick rate and
/// initial label.
#[derive(Debug, Clone)]
pub struct MatchInit {
    pub tick_rate_hz: u32,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct JoinDecision {
    pub allow: bool,
    pub reason: Option<String>,
}

impl JoinDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }
}

/// One message drained from the match's inbound queue this tick.
#[derive(Debug, Clone)]
pub struct MatchDataMessage {
    pub sender: Option<SessionId>,
    pub op_code: i64,
    pub payload: Vec<u8>,
    pub reliable: bool,
}

/// `loop`'s return value: `Continue` keeps the scheduler running,
/// `Terminate` starts the grace-period shutdown (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLoopResult {
    Continue,
    Terminate,
}

/// The seven-function contract. `&mut self` carries the handler's opaque
/// state; there is no separate `state` value threaded through calls the
/// way the source passes it explicitly, since Rust's ownership already
/// gives single-writer access.
#[async_trait::async_trait]
pub trait MatchHandler: Send + Sync + 'static {
    async fn init(&mut self, params: Json) -> anyhow::Result<MatchInit>;

    async fn join_attempt(&mut self, tick: u64, candidate: &Presence, metadata: Json) -> JoinDecision;

    async fn join(&mut self, tick: u64, joins: &[Presence]);

    async fn leave(&mut self, tick: u64, leaves: &[Presence]);

    async fn tick(&mut self, tick: u64, ctx: &mut super::context::MatchContext, inbound: Vec<MatchDataMessage>) -> MatchLoopResult;

    async fn terminate(&mut self, tick: u64, grace_seconds: u32);

    async fn signal(&mut self, tick: u64, data: Vec<u8>) -> Option<Vec<u8>>;
}
