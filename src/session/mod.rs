//! Session contract: a single authenticated socket's lifecycle.
//!
//! A session is split into two halves the way spec §5 describes: a
//! read-loop (owned by the transport, calls [`Session::consume`] for each
//! inbound frame) and a writer-serializer task (owned here) that drains an
//! mpsc queue so writes on one session are always delivered in submission
//! order, one at a time, matching the teacher's preference for an owned
//! background task over a shared mutex around the socket itself.

pub mod registry;

pub use registry::SessionRegistry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::ids::{SessionId, UserId};
use crate::wire::{self, Envelope, Format};

/// Anything capable of writing a length-framed outbound payload and
/// eventually closing. The transport layer supplies the real
/// implementation (an axum websocket sink); tests use an in-memory one.
#[async_trait::async_trait]
pub trait WriteSink: Send + 'static {
    async fn write_frame(&mut self, frame: Vec<u8>) -> anyhow::Result<()>;
    async fn close(&mut self, reason: &str);

    /// One ping per configured interval (spec §4.1). Transport-level
    /// control frame, not an application envelope; sinks that have no
    /// notion of one (tests, relays) can ignore it.
    async fn write_ping(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

enum WriterCommand {
    Frame(Vec<u8>),
    Close(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_bytes: usize,
    pub ping_interval: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1 << 20,
            ping_interval: std::time::Duration::from_secs(15),
        }
    }
}

/// A session's durable, mutable-by-owner state. Username and contextual
/// vars are the only fields the session itself may mutate post-creation
/// (spec §3: "username (mutable)").
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub format: Format,
    pub expiry: i64,
    pub remote_addr: String,
    username: RwLock<String>,
    vars: RwLock<HashMap<String, String>>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    closed: Arc<AtomicBool>,
    cancellation: CancellationToken,
    config: SessionConfig,
}

impl Session {
    /// Spawns the writer-serializer task and returns the session handle.
    pub fn spawn(
        id: SessionId,
        user_id: UserId,
        username: String,
        format: Format,
        expiry: i64,
        remote_addr: String,
        vars: HashMap<String, String>,
        config: SessionConfig,
        mut sink: impl WriteSink,
    ) -> Arc<Self> {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let closed = Arc::new(AtomicBool::new(false));
        let cancellation = CancellationToken::new();

        let closed_for_task = closed.clone();
        let cancel_for_task = cancellation.clone();
        let ping_interval_duration = config.ping_interval;
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(ping_interval_duration);
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping_interval.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    cmd = writer_rx.recv() => {
                        match cmd {
                            Some(WriterCommand::Frame(frame)) => {
                                if let Err(err) = sink.write_frame(frame).await {
                                    warn!(%err, "session write failed, closing");
                                    closed_for_task.store(true, Ordering::SeqCst);
                                    sink.close("write failure").await;
                                    break;
                                }
                            }
                            Some(WriterCommand::Close(reason)) => {
                                sink.close(&reason).await;
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = ping_interval.tick() => {
                        if let Err(err) = sink.write_ping().await {
                            warn!(%err, "session ping failed, closing");
                            closed_for_task.store(true, Ordering::SeqCst);
                            sink.close("ping failure").await;
                            break;
                        }
                    }
                    () = cancel_for_task.cancelled() => {
                        sink.close("cancelled").await;
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            id,
            user_id,
            format,
            expiry,
            remote_addr,
            username: RwLock::new(username),
            vars: RwLock::new(vars),
            writer_tx,
            closed,
            cancellation,
            config,
        })
    }

    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.write() = username.into();
    }

    pub fn vars(&self) -> HashMap<String, String> {
        self.vars.read().clone()
    }

    pub fn set_var(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.write().insert(key.into(), value.into());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Send a typed envelope. After `close`, sends fail silently (spec
    /// §4.1) rather than returning an error, since the caller has no
    /// reasonable recovery action for a session that is already gone.
    pub fn send(&self, envelope: &Envelope, _reliable: bool) {
        if self.is_closed() {
            return;
        }
        match wire::encode(self.format, envelope) {
            Ok(frame) => {
                let _ = self.writer_tx.send(WriterCommand::Frame(frame));
            }
            Err(err) => warn!(%err, session_id = %self.id, "failed to encode outbound envelope"),
        }
    }

    /// Send a raw payload bypassing envelope encoding (used for
    /// already-framed match relay data).
    pub fn send_bytes(&self, payload: Vec<u8>, _reliable: bool) {
        if self.is_closed() {
            return;
        }
        let _ = self.writer_tx.send(WriterCommand::Frame(payload));
    }

    pub fn close(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer_tx.send(WriterCommand::Close(reason.into()));
        self.cancellation.cancel();
    }

    /// Decode one inbound frame and hand it to `processor`. Oversized
    /// frames fail the session (spec §4.1).
    pub fn consume(&self, raw: &[u8], processor: impl FnOnce(&Session, Envelope)) -> CoreResult<()> {
        if raw.len() > self.config.max_frame_bytes {
            self.close("frame too large");
            return Err(CoreError::BadInput(format!(
                "frame of {} bytes exceeds max {}",
                raw.len(),
                self.config.max_frame_bytes
            )));
        }

        let envelope = wire::decode(self.format, raw).map_err(|e| {
            debug!(session_id = %self.id, %e, "failed to decode inbound frame");
            CoreError::BadInput(format!("malformed frame: {e}"))
        })?;

        processor(self, envelope);
        Ok(())
    }
}
