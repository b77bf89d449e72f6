//! What a handler can do to the outside world from inside `tick` (spec
//! §4.2 "broadcastMessage", "matchLabelUpdate").

use crate::ids::SessionId;
use crate::presence::Presence;

pub struct OutboundMessage {
    pub op_code: i64,
    pub data: Vec<u8>,
    pub presences: Option<Vec<Presence>>,
    pub sender: Option<SessionId>,
    pub reliable: bool,
}

/// Scratch space handed to `MatchHandler::tick`. Queued broadcasts and
/// label changes are applied by the scheduler after the call returns, per
/// the fixed tick sequence: loop, then label update, then broadcast.
pub struct MatchContext {
    label: String,
    pending_label: Option<String>,
    outbound: Vec<OutboundMessage>,
}

impl MatchContext {
    pub fn new(label: String) -> Self {
        Self {
            label,
            pending_label: None,
            outbound: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// `label.len() > 256` is rejected by the caller before this is
    /// surfaced to the handler; this layer just records the intent.
    pub fn update_label(&mut self, label: String) {
        self.pending_label = Some(label);
    }

    /// A zero-length `presences` filter is a no-op and drops the message
    /// before it is even queued (spec §4.2).
    pub fn broadcast_message(
        &mut self,
        op_code: i64,
        data: Vec<u8>,
        presences: Option<Vec<Presence>>,
        sender: Option<SessionId>,
        reliable: bool,
    ) {
        if let Some(targets) = &presences {
            if targets.is_empty() {
                return;
            }
        }
        self.outbound.push(OutboundMessage {
            op_code,
            data,
            presences,
            sender,
            reliable,
        });
    }

    pub(super) fn take_label_update(&mut self) -> Option<String> {
        if let Some(label) = self.pending_label.take() {
            self.label = label.clone();
            Some(label)
        } else {
            None
        }
    }

    pub(super) fn drain_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbound)
    }
}
