//! Message Router: fans out an envelope to a set of sessions, encoding once
//! per wire format (spec §4.1 "Routing").

use tracing::debug;

use crate::ids::SessionId;
use crate::presence::{PresenceTracker, Stream};
use crate::session::SessionRegistry;
use crate::wire::Envelope;

pub struct Router<'a> {
    registry: &'a SessionRegistry,
    presence: &'a PresenceTracker,
}

impl<'a> Router<'a> {
    pub fn new(registry: &'a SessionRegistry, presence: &'a PresenceTracker) -> Self {
        Self { registry, presence }
    }

    /// Sends `message` to exactly `targets`, ignoring sessions that have
    /// since disconnected (logged, not fatal).
    pub fn send(&self, targets: &[SessionId], message: &Envelope, reliable: bool) {
        for &target in targets {
            match self.registry.get(target) {
                Some(session) => session.send(message, reliable),
                None => debug!(session_id = %target, "dropping send to disconnected session"),
            }
        }
    }

    /// Resolves `stream`'s presence set then sends to every resident
    /// session.
    pub fn send_to_stream(&self, stream: &Stream, message: &Envelope, reliable: bool) {
        let targets: Vec<SessionId> = self
            .presence
            .list(stream, true)
            .into_iter()
            .map(|p| p.session_id)
            .collect();
        self.send(&targets, message, reliable);
    }
}
