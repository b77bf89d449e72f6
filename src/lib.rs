//! `arcadia-core`: the core runtime for a realtime game backend — sessions,
//! authoritative matches, matchmaking, channels and leaderboards.
//!
//! Laid out the way the teacher repo groups one module tree per subsystem
//! under `src/`, with `main.rs` kept thin (config from env, wiring,
//! signal handling) and the actual logic living here so it is testable via
//! colocated `#[cfg(test)]` blocks.

pub mod auth;
pub mod caller;
pub mod channel;
pub mod clock;
pub mod cursor;
pub mod error;
pub mod ids;
pub mod leaderboard;
pub mod matchmaker;
pub mod mtch;
pub mod presence;
pub mod router;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod wire;

use std::sync::Arc;

use axum::routing::get;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use channel::{ChannelService, InMemoryChannelStorage};
use leaderboard::{InMemoryLeaderboardStorage, LeaderboardCache};
use matchmaker::Matchmaker;
use mtch::MatchRegistry;
use presence::PresenceTracker;
use runtime::Runtime;
use session::SessionRegistry;
use transport::{ChannelGateway, TokenValidator, TransportState};

/// The subsystems one running node needs, wired together once at startup.
/// Not itself named in spec.md — spec.md describes each subsystem's
/// contract, not how a host assembles them — but a complete binary needs
/// exactly this, the same role the teacher's `QubitCtx` plays for its own
/// (smaller) set of shared handles.
pub struct Core {
    pub sessions: Arc<SessionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub matches: Arc<MatchRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub channels: Arc<ChannelService<InMemoryChannelStorage>>,
    pub leaderboards: Arc<LeaderboardCache<InMemoryLeaderboardStorage>>,
    pub runtime: Arc<Runtime>,
    pub engine_config: mtch::MatchEngineConfig,
}

impl Core {
    /// Builds every subsystem and wires the Matchmaker's `matched`
    /// callback so completed ticket groups reach the Extension Runtime
    /// (spec §4.3 "matched callback... returns either a match identifier
    /// to create/route into, or empty to leave tickets consumed but
    /// unrouted (rare — logged)").
    ///
    /// The runtime decides what to do with a completed group via the
    /// `matchmaker_matched` invocation mode; this host does not create a
    /// match on the matchmaker's behalf automatically, since spec §4.6
    /// reserves match creation for user code running inside the Extension
    /// Runtime.
    pub fn new(runtime: Runtime, tracker: TaskTracker) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new());
        let presence = Arc::new(PresenceTracker::new());
        let matches = Arc::new(MatchRegistry::new());
        let channels = Arc::new(ChannelService::new(
            InMemoryChannelStorage::new(),
            sessions.clone(),
            presence.clone(),
        ));
        let leaderboards = LeaderboardCache::new(InMemoryLeaderboardStorage::new());
        let runtime = Arc::new(runtime);

        let runtime_for_callback = runtime.clone();
        let tracker_for_callback = tracker.clone();
        let matchmaker = Arc::new(Matchmaker::new(move |tickets| {
            let runtime = runtime_for_callback.clone();
            let ticket_ids = tickets.iter().map(|t| t.id.to_string()).collect();
            tracker_for_callback.spawn(async move {
                let mode = runtime::InvocationMode::MatchmakerMatched { ticket_ids };
                if !runtime.is_registered(&mode.registration_key()) {
                    info!("matchmaker group completed but no matchmaker_matched handler is registered, leaving it unrouted");
                    return;
                }
                if let Err(err) = runtime.invoke(runtime::RuntimeContext::default(), mode).await {
                    warn!(%err, "matchmaker_matched handler failed");
                }
            });
        }));

        Arc::new(Self {
            sessions,
            presence,
            matches,
            matchmaker,
            channels,
            leaderboards,
            runtime,
            engine_config: mtch::MatchEngineConfig::default(),
        })
    }

    pub fn transport_state(
        &self,
        token_validator: Arc<dyn TokenValidator>,
        session_config: session::SessionConfig,
        single_socket: bool,
    ) -> Arc<TransportState> {
        Arc::new(TransportState {
            sessions: self.sessions.clone(),
            presence: self.presence.clone(),
            matches: self.matches.clone(),
            channels: self.channels.clone() as Arc<dyn ChannelGateway>,
            token_validator,
            session_config,
            single_socket,
        })
    }
}

/// The crate's single HTTP surface: the websocket upgrade route (spec §6).
/// Everything else named "HTTP/gRPC route surface" in spec.md's Non-goals
/// stays out of this router.
pub fn build_router(state: Arc<TransportState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(transport::upgrade))
        .with_state(state)
}
