//! Authoritative Match Engine (spec §4.2): one fixed-rate tick task per
//! match, generalized from the teacher's single global match loop
//! (`abduction-server/src/main.rs::tick_loop`) to many concurrent matches
//! managed by a [`MatchRegistry`].

mod context;
mod handler;
mod registry;
mod scheduler;

pub use context::{MatchContext, OutboundMessage};
pub use handler::{JoinDecision, MatchDataMessage, MatchHandler, MatchInit, MatchLoopResult};
pub use registry::MatchRegistry;
pub use scheduler::TERMINATE_OP_CODE;

use std::time::Duration;

/// Knobs for the tick scheduler that spec.md leaves to the host rather than
/// specifying exactly (§9 "configuration loading" is out of scope, but the
/// scheduler still needs these to exist).
#[derive(Debug, Clone)]
pub struct MatchEngineConfig {
    /// How long a match stays alive after its loop returns `Terminate` or
    /// the host cancels it, broadcasting the terminate op only once this
    /// elapses (spec §4.2 "Match lifecycle").
    pub shutdown_grace: Duration,
    /// Consecutive empty ticks (no presences, no inbound activity) before a
    /// match is torn down on its own, independent of an explicit terminate
    /// (spec.md's "destroyed when loop returns terminate or match is idle
    /// past grace"). `None` disables the idle timeout.
    pub idle_ticks_before_close: Option<u64>,
}

impl Default for MatchEngineConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            idle_ticks_before_close: Some(20 * 60 * 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value as Json};
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::presence::{PresenceMeta, PresenceTracker, Presence, Stream, StreamMode};
    use crate::session::SessionRegistry;
    use crate::wire::Format;

    struct CountingHandler {
        ticks: Arc<AtomicUsize>,
        terminate_after: Option<u64>,
    }

    #[async_trait::async_trait]
    impl MatchHandler for CountingHandler {
        async fn init(&mut self, _params: Json) -> anyhow::Result<MatchInit> {
            Ok(MatchInit {
                tick_rate_hz: 20,
                label: "lobby".into(),
            })
        }

        async fn join_attempt(&mut self, _tick: u64, _candidate: &Presence, _metadata: Json) -> JoinDecision {
            JoinDecision::allow()
        }

        async fn join(&mut self, _tick: u64, _joins: &[Presence]) {}

        async fn leave(&mut self, _tick: u64, _leaves: &[Presence]) {}

        async fn tick(&mut self, tick: u64, _ctx: &mut MatchContext, _inbound: Vec<MatchDataMessage>) -> MatchLoopResult {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            match self.terminate_after {
                Some(limit) if tick >= limit => MatchLoopResult::Terminate,
                _ => MatchLoopResult::Continue,
            }
        }

        async fn terminate(&mut self, _tick: u64, _grace_seconds: u32) {}

        async fn signal(&mut self, _tick: u64, data: Vec<u8>) -> Option<Vec<u8>> {
            Some(data)
        }
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl MatchHandler for PanickingHandler {
        async fn init(&mut self, _params: Json) -> anyhow::Result<MatchInit> {
            Ok(MatchInit {
                tick_rate_hz: 30,
                label: String::new(),
            })
        }

        async fn join_attempt(&mut self, _tick: u64, _candidate: &Presence, _metadata: Json) -> JoinDecision {
            JoinDecision::allow()
        }

        async fn join(&mut self, _tick: u64, _joins: &[Presence]) {}

        async fn leave(&mut self, _tick: u64, _leaves: &[Presence]) {}

        async fn tick(&mut self, _tick: u64, _ctx: &mut MatchContext, _inbound: Vec<MatchDataMessage>) -> MatchLoopResult {
            panic!("boom");
        }

        async fn terminate(&mut self, _tick: u64, _grace_seconds: u32) {}

        async fn signal(&mut self, _tick: u64, _data: Vec<u8>) -> Option<Vec<u8>> {
            None
        }
    }

    fn engine_config(shutdown_grace_ms: u64) -> MatchEngineConfig {
        MatchEngineConfig {
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            idle_ticks_before_close: None,
        }
    }

    fn harness() -> (TaskTracker, MatchRegistry, Arc<SessionRegistry>, Arc<PresenceTracker>) {
        (
            TaskTracker::new(),
            MatchRegistry::new(),
            Arc::new(SessionRegistry::new()),
            Arc::new(PresenceTracker::new()),
        )
    }

    #[tokio::test]
    async fn init_rejects_propagate_to_the_caller() {
        struct RejectingHandler;
        #[async_trait::async_trait]
        impl MatchHandler for RejectingHandler {
            async fn init(&mut self, _params: Json) -> anyhow::Result<MatchInit> {
                Err(anyhow::anyhow!("bad params"))
            }
            async fn join_attempt(&mut self, _tick: u64, _candidate: &Presence, _metadata: Json) -> JoinDecision {
                JoinDecision::allow()
            }
            async fn join(&mut self, _tick: u64, _joins: &[Presence]) {}
            async fn leave(&mut self, _tick: u64, _leaves: &[Presence]) {}
            async fn tick(&mut self, _tick: u64, _ctx: &mut MatchContext, _inbound: Vec<MatchDataMessage>) -> MatchLoopResult {
                MatchLoopResult::Continue
            }
            async fn terminate(&mut self, _tick: u64, _grace_seconds: u32) {}
            async fn signal(&mut self, _tick: u64, _data: Vec<u8>) -> Option<Vec<u8>> {
                None
            }
        }

        let (tracker, matches, registry, presence) = harness();
        let result = matches
            .create(&tracker, "node-a", RejectingHandler, json!({}), registry, presence, engine_config(1000))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tick_loop_runs_at_the_requested_rate() {
        let (tracker, matches, registry, presence) = harness();
        let ticks = Arc::new(AtomicUsize::new(0));
        let match_id = matches
            .create(
                &tracker,
                "node-a",
                CountingHandler {
                    ticks: ticks.clone(),
                    terminate_after: None,
                },
                json!({}),
                registry,
                presence,
                engine_config(50),
            )
            .await
            .unwrap();

        assert_eq!(matches.tick_rate(&match_id), Some(20));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        matches.shutdown(&match_id);
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn loop_returning_terminate_ends_the_match_after_grace() {
        let (tracker, matches, registry, presence) = harness();
        let ticks = Arc::new(AtomicUsize::new(0));
        let match_id = matches
            .create(
                &tracker,
                "node-a",
                CountingHandler {
                    ticks: ticks.clone(),
                    terminate_after: Some(1),
                },
                json!({}),
                registry,
                presence,
                engine_config(30),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!matches.exists(&match_id));
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn join_attempt_round_trips_through_the_inbound_queue() {
        let (tracker, matches, registry, presence) = harness();
        let match_id = matches
            .create(
                &tracker,
                "node-a",
                CountingHandler {
                    ticks: Arc::new(AtomicUsize::new(0)),
                    terminate_after: None,
                },
                json!({}),
                registry,
                presence.clone(),
                engine_config(50),
            )
            .await
            .unwrap();

        let candidate = Presence {
            stream: Stream::new(StreamMode::MatchAuthoritative, match_id.to_string()),
            session_id: crate::ids::new_id(),
            user_id: crate::ids::new_id(),
            meta: PresenceMeta {
                username: "p1".into(),
                format: Format::Text,
                hidden: false,
                status: None,
            },
        };
        let decision = matches.join_attempt(&match_id, candidate, json!({})).await.unwrap();
        assert!(decision.allow);

        matches.shutdown(&match_id);
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn handler_panic_terminates_only_that_match() {
        let (tracker, matches, registry, presence) = harness();
        let match_id = matches
            .create(&tracker, "node-a", PanickingHandler, json!({}), registry, presence, engine_config(200))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The task should have exited on its own after the panic; closing
        // the tracker should not hang waiting on it.
        tracker.close();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("match task should have terminated after the handler panic");
        let _ = match_id;
    }

    #[tokio::test]
    async fn idle_match_closes_itself_once_the_idle_budget_is_spent() {
        let (tracker, matches, registry, presence) = harness();
        let match_id = matches
            .create(
                &tracker,
                "node-a",
                CountingHandler {
                    ticks: Arc::new(AtomicUsize::new(0)),
                    terminate_after: None,
                },
                json!({}),
                registry,
                presence,
                MatchEngineConfig {
                    shutdown_grace: Duration::from_millis(10),
                    idle_ticks_before_close: Some(3),
                },
            )
            .await
            .unwrap();

        // tick rate is 20hz (50ms/tick); 3 idle ticks plus slack comfortably
        // fits in 400ms without relying on exact scheduler timing.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!matches.exists(&match_id));
        tracker.close();
        tracker.wait().await;
    }
}
