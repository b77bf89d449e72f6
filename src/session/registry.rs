//! Session Registry: `sessionId -> session`, single-owner close semantics.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::ids::{SessionId, UserId};
use crate::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Optional single-socket-per-user enforcement (spec §4.1).
    by_user: DashMap<UserId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. If `single_socket` is set, any other session
    /// belonging to the same user is closed *after* the new one is
    /// admitted, per spec §4.1.
    pub fn add(&self, session: Arc<Session>, single_socket: bool) {
        let user_id = session.user_id;
        let id = session.id;
        self.sessions.insert(id, session);

        if single_socket {
            if let Some((_, previous)) = self.by_user.remove(&user_id) {
                if previous != id {
                    if let Some(old) = self.sessions.get(&previous) {
                        debug!(%previous, "closing previous session for single-socket policy");
                        old.close("replaced by a new session for this user");
                    }
                }
            }
            self.by_user.insert(user_id, id);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Idempotent removal.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Fire-and-forget: merely invokes `close`, does not wait for the
    /// writer task to drain.
    pub fn disconnect(&self, id: SessionId, reason: impl Into<String>) {
        if let Some(session) = self.sessions.get(&id) {
            session.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, WriteSink};
    use crate::wire::Format;
    use std::collections::HashMap;

    struct NullSink;
    #[async_trait::async_trait]
    impl WriteSink for NullSink {
        async fn write_frame(&mut self, _frame: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&mut self, _reason: &str) {}
    }

    fn make_session(user_id: UserId) -> Arc<Session> {
        Session::spawn(
            crate::ids::new_id(),
            user_id,
            "user".into(),
            Format::Text,
            0,
            "addr".into(),
            HashMap::new(),
            SessionConfig::default(),
            NullSink,
        )
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = make_session(crate::ids::new_id());
        let id = session.id;
        registry.add(session, false);
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
    }

    #[tokio::test]
    async fn single_socket_policy_closes_previous_session() {
        let registry = SessionRegistry::new();
        let user_id = crate::ids::new_id();
        let first = make_session(user_id);
        let second = make_session(user_id);

        registry.add(first.clone(), true);
        assert!(!first.is_closed());

        registry.add(second.clone(), true);
        tokio::task::yield_now().await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }
}
