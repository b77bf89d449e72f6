//! The fixed-rate per-match tick loop (spec §4.2 "Scheduling"), one task
//! per match the way the teacher's `tick_loop` is one task per running
//! match (`src/main.rs`), generalized from a single global match to many
//! concurrent ones.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ids::{MatchId, SessionId};
use crate::presence::{Presence, PresenceTracker, Stream, StreamMode};
use crate::router::Router;
use crate::session::SessionRegistry;
use crate::wire::{Envelope, EnvelopeBody};

use super::context::MatchContext;
use super::handler::{JoinDecision, MatchDataMessage, MatchHandler, MatchLoopResult};

pub const INBOUND_QUEUE_CAPACITY: usize = 256;

pub(super) enum InboundEvent {
    Data(MatchDataMessage),
    JoinAttempt {
        presence: Presence,
        metadata: Json,
        reply: oneshot::Sender<JoinDecision>,
    },
    Leave(Presence),
    Signal {
        data: Vec<u8>,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
}

pub(super) struct SpawnArgs<H: MatchHandler> {
    pub match_id: MatchId,
    pub handler: H,
    pub init_params: Json,
    pub inbound_rx: mpsc::Receiver<InboundEvent>,
    pub registry: Arc<SessionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub label: Arc<RwLock<String>>,
    pub cancel: CancellationToken,
    pub shutdown_grace: Duration,
    pub idle_ticks_before_close: Option<u64>,
    pub ready: Option<oneshot::Sender<anyhow::Result<u32>>>,
    /// Flipped once this task has returned for any reason, so the registry
    /// can tell a self-terminated match apart from a running one without a
    /// separate reaper task.
    pub done: Arc<AtomicBool>,
}

fn authoritative_stream(match_id: &MatchId) -> Stream {
    Stream::new(StreamMode::MatchAuthoritative, match_id.to_string())
}

/// Runs until the handler terminates the match, a panic is caught, or the
/// host cancels it. Consumes `args` so callers can't keep a stale handle.
pub(super) async fn run<H: MatchHandler>(mut args: SpawnArgs<H>) {
    let stream = authoritative_stream(&args.match_id);

    let init_result = AssertUnwindSafe(args.handler.init(std::mem::take(&mut args.init_params)))
        .catch_unwind()
        .await;
    let init = match init_result {
        Ok(Ok(init)) => init,
        Ok(Err(err)) => {
            let _ = args.ready.take().unwrap().send(Err(err));
            return;
        }
        Err(_) => {
            let _ = args
                .ready
                .take()
                .unwrap()
                .send(Err(anyhow::anyhow!("match handler panicked during init")));
            return;
        }
    };

    let tick_rate = init.tick_rate_hz.clamp(1, 30);
    *args.label.write() = init.label.clone();
    if args.ready.take().unwrap().send(Ok(tick_rate)).is_err() {
        return;
    }
    // Marks the match done on every exit path below, including the early
    // `return`s inside the panic-recovery branches, without repeating the
    // store at each call site.
    struct MarkDoneOnDrop(Arc<AtomicBool>);
    impl Drop for MarkDoneOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }
    let _mark_done = MarkDoneOnDrop(args.done.clone());

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_rate as f64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut tick: u64 = 0;
    let mut joined: Vec<Presence> = Vec::new();
    let mut terminating_at: Option<Instant> = None;
    let mut idle_ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = args.cancel.cancelled() => {
                info!(match_id = %args.match_id, "match cancelled by host, terminating immediately");
                run_terminate(&mut args.handler, tick, 0).await;
                break;
            }
        }

        let mut data_msgs = Vec::new();
        let mut join_attempts = Vec::new();
        let mut pending_leaves = Vec::new();
        let mut signals = Vec::new();
        let mut disconnected = false;
        loop {
            match args.inbound_rx.try_recv() {
                Ok(InboundEvent::Data(m)) => data_msgs.push(m),
                Ok(InboundEvent::JoinAttempt { presence, metadata, reply }) => {
                    join_attempts.push((presence, metadata, reply))
                }
                Ok(InboundEvent::Leave(p)) => pending_leaves.push(p),
                Ok(InboundEvent::Signal { data, reply }) => signals.push((data, reply)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        let mut admitted = Vec::new();
        for (presence, metadata, reply) in join_attempts {
            let decision = if terminating_at.is_some() {
                JoinDecision::reject("match is terminating")
            } else {
                match AssertUnwindSafe(args.handler.join_attempt(tick, &presence, metadata))
                    .catch_unwind()
                    .await
                {
                    Ok(decision) => decision,
                    Err(_) => {
                        error!(match_id = %args.match_id, "joinAttempt panicked");
                        let _ = reply.send(JoinDecision::reject("match terminated"));
                        terminate_after_panic(&args, tick, &joined, &stream).await;
                        return;
                    }
                }
            };
            let allow = decision.allow;
            let _ = reply.send(decision);
            if allow {
                args.presence.track(
                    presence.session_id,
                    presence.stream.clone(),
                    presence.user_id,
                    presence.meta.clone(),
                );
                joined.push(presence.clone());
                admitted.push(presence);
            }
        }

        if !admitted.is_empty() {
            if catch_panic(AssertUnwindSafe(args.handler.join(tick, &admitted))).await.is_err() {
                terminate_after_panic(&args, tick, &joined, &stream).await;
                return;
            }
        }

        if !pending_leaves.is_empty() {
            let leaving_ids: std::collections::HashSet<SessionId> =
                pending_leaves.iter().map(|p| p.session_id).collect();
            joined.retain(|p| !leaving_ids.contains(&p.session_id));
            if catch_panic(AssertUnwindSafe(args.handler.leave(tick, &pending_leaves)))
                .await
                .is_err()
            {
                terminate_after_panic(&args, tick, &joined, &stream).await;
                return;
            }
        }

        for (data, reply) in signals {
            match catch_panic(AssertUnwindSafe(args.handler.signal(tick, data))).await {
                Ok(response) => {
                    let _ = reply.send(response);
                }
                Err(_) => {
                    terminate_after_panic(&args, tick, &joined, &stream).await;
                    return;
                }
            }
        }

        if terminating_at.is_none() {
            let tick_was_idle = joined.is_empty() && data_msgs.is_empty();
            let mut ctx = MatchContext::new(args.label.read().clone());
            let loop_result = catch_panic(AssertUnwindSafe(args.handler.tick(tick, &mut ctx, data_msgs))).await;
            match loop_result {
                Ok(MatchLoopResult::Continue) => {}
                Ok(MatchLoopResult::Terminate) => {
                    terminating_at = Some(Instant::now() + args.shutdown_grace);
                    info!(match_id = %args.match_id, "match loop requested termination, starting grace period");
                }
                Err(_) => {
                    terminate_after_panic(&args, tick, &joined, &stream).await;
                    return;
                }
            }

            if let Some(new_label) = ctx.take_label_update() {
                *args.label.write() = new_label;
            }

            for outbound in ctx.drain_outbound() {
                broadcast(&args, &stream, &joined, outbound);
            }

            if terminating_at.is_none() {
                idle_ticks = if tick_was_idle { idle_ticks + 1 } else { 0 };
                if let Some(limit) = args.idle_ticks_before_close {
                    if idle_ticks >= limit {
                        info!(match_id = %args.match_id, idle_ticks, "match idle past grace, terminating");
                        run_terminate(&mut args.handler, tick, 0).await;
                        broadcast_terminate(&args, &stream, &joined);
                        break;
                    }
                }
            }
        } else {
            for msg in data_msgs {
                debug!(match_id = %args.match_id, op_code = msg.op_code, "dropping inbound data during termination grace period");
            }
        }

        if disconnected {
            warn!(match_id = %args.match_id, "inbound queue sender dropped, terminating match");
            run_terminate(&mut args.handler, tick, 0).await;
            break;
        }

        if let Some(deadline) = terminating_at {
            if Instant::now() >= deadline {
                let grace = args.shutdown_grace.as_secs() as u32;
                run_terminate(&mut args.handler, tick, grace).await;
                broadcast_terminate(&args, &stream, &joined);
                break;
            }
        }

        tick += 1;
    }

    for presence in &joined {
        args.presence.untrack(presence.session_id, &stream, presence.user_id);
    }
    info!(match_id = %args.match_id, ticks = tick, "match loop exited");
}

async fn catch_panic<F>(fut: F) -> Result<F::Output, ()>
where
    F: std::future::Future + std::panic::UnwindSafe,
{
    fut.catch_unwind().await.map_err(|_| ())
}

async fn run_terminate<H: MatchHandler>(handler: &mut H, tick: u64, grace_seconds: u32) {
    if catch_panic(AssertUnwindSafe(handler.terminate(tick, grace_seconds)))
        .await
        .is_err()
    {
        error!("terminate handler itself panicked, abandoning match state");
    }
}

async fn terminate_after_panic<H: MatchHandler>(
    args: &SpawnArgs<H>,
    _tick: u64,
    joined: &[Presence],
    stream: &Stream,
) {
    error!(match_id = %args.match_id, "match handler panicked, terminating match without exposing state");
    broadcast_terminate(args, stream, joined);
    for presence in joined {
        args.presence.untrack(presence.session_id, stream, presence.user_id);
    }
}

/// The op code reserved for the terminate signal broadcast to members when
/// a match ends or its handler panics (spec §4.2 "Failure semantics").
pub const TERMINATE_OP_CODE: i64 = -1;

fn broadcast_terminate<H: MatchHandler>(args: &SpawnArgs<H>, stream: &Stream, joined: &[Presence]) {
    let envelope = Envelope {
        cid: None,
        body: EnvelopeBody::MatchData {
            match_id: args.match_id.clone(),
            op_code: TERMINATE_OP_CODE,
            payload: Vec::new(),
            reliable: true,
            sender_session_id: None,
        },
    };
    let router = Router::new(&args.registry, &args.presence);
    let _ = joined;
    router.send_to_stream(stream, &envelope, true);
}

fn broadcast<H: MatchHandler>(
    args: &SpawnArgs<H>,
    stream: &Stream,
    joined: &[Presence],
    outbound: super::context::OutboundMessage,
) {
    let sender_session_id = outbound.sender;
    let envelope = Envelope {
        cid: None,
        body: EnvelopeBody::MatchData {
            match_id: args.match_id.clone(),
            op_code: outbound.op_code,
            payload: outbound.data,
            reliable: outbound.reliable,
            sender_session_id,
        },
    };
    let router = Router::new(&args.registry, &args.presence);
    match outbound.presences {
        None => router.send_to_stream(stream, &envelope, outbound.reliable),
        Some(targets) => {
            let member_ids: std::collections::HashSet<SessionId> = joined.iter().map(|p| p.session_id).collect();
            let session_ids: Vec<SessionId> = targets
                .iter()
                .filter(|p| member_ids.contains(&p.session_id))
                .map(|p| p.session_id)
                .collect();
            router.send(&session_ids, &envelope, outbound.reliable);
        }
    }
}
