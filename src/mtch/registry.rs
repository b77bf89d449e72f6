//! Tracks running matches and is the only way anything outside a match's
//! own tick task touches it — every external command crosses the inbound
//! queue or a oneshot reply, consistent with spec §5 "Match state is never
//! accessed outside its tick task".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::ids::MatchId;
use crate::presence::{Presence, PresenceTracker};
use crate::session::SessionRegistry;

use super::handler::{JoinDecision, MatchDataMessage, MatchHandler};
use super::scheduler::{self, InboundEvent, SpawnArgs, INBOUND_QUEUE_CAPACITY};
use super::MatchEngineConfig;

struct MatchHandle {
    label: Arc<RwLock<String>>,
    tick_rate_hz: u32,
    inbound_tx: mpsc::Sender<InboundEvent>,
    cancel: CancellationToken,
    /// Set by the scheduler task itself once it exits, whether by explicit
    /// terminate, idle timeout, or cancellation — lets a self-terminated
    /// match be reaped on the next `create` without a dedicated background
    /// task.
    done: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct MatchRegistry {
    matches: DashMap<MatchId, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a new authoritative match, running the handler's `init` and
    /// waiting for it to either accept (returning the tick rate) or reject.
    pub async fn create<H: MatchHandler>(
        &self,
        tracker: &TaskTracker,
        node: impl Into<String>,
        handler: H,
        init_params: Json,
        registry: Arc<SessionRegistry>,
        presence: Arc<PresenceTracker>,
        engine_config: MatchEngineConfig,
    ) -> CoreResult<MatchId> {
        let match_id = MatchId::new_authoritative(node.into());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let label = Arc::new(RwLock::new(String::new()));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));

        let args = SpawnArgs {
            match_id: match_id.clone(),
            handler,
            init_params,
            inbound_rx,
            registry,
            presence,
            label: label.clone(),
            cancel: cancel.clone(),
            shutdown_grace: engine_config.shutdown_grace,
            idle_ticks_before_close: engine_config.idle_ticks_before_close,
            ready: Some(ready_tx),
            done: done.clone(),
        };

        tracker.spawn(scheduler::run(args));

        let tick_rate_hz = ready_rx
            .await
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("match task dropped before init finished")))?
            .map_err(CoreError::Internal)?;

        self.reap_finished();
        self.matches.insert(
            match_id.clone(),
            MatchHandle {
                label,
                tick_rate_hz,
                inbound_tx,
                cancel,
                done,
            },
        );
        Ok(match_id)
    }

    /// Drops handles for matches whose tick task has already exited on its
    /// own (explicit terminate, idle timeout). Called opportunistically
    /// from `create` rather than from a dedicated background task.
    fn reap_finished(&self) {
        self.matches.retain(|_, handle| !handle.done.load(Ordering::SeqCst));
    }

    pub fn exists(&self, match_id: &MatchId) -> bool {
        self.matches
            .get(match_id)
            .is_some_and(|m| !m.done.load(Ordering::SeqCst))
    }

    pub fn label(&self, match_id: &MatchId) -> Option<String> {
        self.matches.get(match_id).map(|m| m.label.read().clone())
    }

    pub fn tick_rate(&self, match_id: &MatchId) -> Option<u32> {
        self.matches.get(match_id).map(|m| m.tick_rate_hz)
    }

    pub fn send_data(&self, match_id: &MatchId, message: MatchDataMessage) -> CoreResult<()> {
        let handle = self
            .matches
            .get(match_id)
            .ok_or_else(|| CoreError::NotFound(format!("match {match_id}")))?;
        if handle.inbound_tx.try_send(InboundEvent::Data(message)).is_err() {
            warn!(%match_id, "match inbound queue full, dropping message");
        }
        Ok(())
    }

    pub async fn join_attempt(
        &self,
        match_id: &MatchId,
        presence: Presence,
        metadata: Json,
    ) -> CoreResult<JoinDecision> {
        let inbound_tx = {
            let handle = self
                .matches
                .get(match_id)
                .ok_or_else(|| CoreError::NotFound(format!("match {match_id}")))?;
            handle.inbound_tx.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        inbound_tx
            .send(InboundEvent::JoinAttempt {
                presence,
                metadata,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoreError::NotFound(format!("match {match_id}")))?;
        reply_rx
            .await
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("match dropped join attempt reply")))
    }

    /// Removes `presences` from the authoritative stream immediately and
    /// queues a `leave` for the next tick (spec §4.2 "Kick").
    pub fn kick(&self, match_id: &MatchId, presence_tracker: &PresenceTracker, presences: Vec<Presence>) {
        let Some(handle) = self.matches.get(match_id) else {
            return;
        };
        for presence in presences {
            presence_tracker.untrack(presence.session_id, &presence.stream, presence.user_id);
            if handle.inbound_tx.try_send(InboundEvent::Leave(presence)).is_err() {
                warn!(%match_id, "match inbound queue full, dropping kick notification");
            }
        }
    }

    pub async fn signal(&self, match_id: &MatchId, data: Vec<u8>) -> CoreResult<Option<Vec<u8>>> {
        let inbound_tx = {
            let handle = self
                .matches
                .get(match_id)
                .ok_or_else(|| CoreError::NotFound(format!("match {match_id}")))?;
            handle.inbound_tx.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        inbound_tx
            .send(InboundEvent::Signal { data, reply: reply_tx })
            .await
            .map_err(|_| CoreError::NotFound(format!("match {match_id}")))?;
        reply_rx
            .await
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("match dropped signal reply")))
    }

    /// Cancels a match immediately; the scheduler runs `terminate` with
    /// zero grace and broadcasts the terminate op before exiting.
    pub fn shutdown(&self, match_id: &MatchId) {
        if let Some((_, handle)) = self.matches.remove(match_id) {
            handle.cancel.cancel();
        }
    }

    /// Allocates a relayed match id — relayed matches never touch the tick
    /// loop, so there is nothing to register here (spec §9).
    pub fn new_relayed_id() -> MatchId {
        MatchId::new_relayed()
    }
}
