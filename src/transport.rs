//! HTTP-upgrade transport (spec §6 "Transport"/"Authentication"): the
//! websocket handler wiring external sockets to [`Session`]/[`WriteSink`].
//!
//! The teacher's own transport (`main.rs`) never speaks raw sockets —
//! it fronts typed RPCs through `qubit` over `hyper` (dropped, see
//! DESIGN.md). This module is grounded instead on the split-sink/reader,
//! serialized-writer-task shape common across the retrieval pack's socket
//! servers, targeting `axum`'s own `ws` feature since `axum`/`hyper` are
//! already the teacher's transport crates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::caller::Caller;
use crate::channel::{ChannelId, ChannelService, ChannelStorage};
use crate::clock::now_epoch_secs;
use crate::error::CoreError;
use crate::ids::{MatchId, SessionId, UserId};
use crate::mtch::{MatchDataMessage, MatchRegistry};
use crate::presence::{PresenceTracker, Stream, StreamMode};
use crate::router::Router;
use crate::session::{Session, SessionConfig, SessionRegistry, WriteSink};
use crate::wire::{Envelope, EnvelopeBody, Format};

/// What a bearer token decodes to (spec §6 "Authentication"). How a token
/// is actually minted is an external concern (spec.md Non-goals: "identity
/// issuance (external token issuer)") — the host plugs in the decoder.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub user_id: UserId,
    pub username: String,
    pub vars: HashMap<String, String>,
    pub expiry: i64,
}

#[async_trait::async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate(&self, token: &str) -> Result<TokenClaims, CoreError>;
}

#[async_trait::async_trait]
impl<F, Fut> TokenValidator for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<TokenClaims, CoreError>> + Send + 'static,
{
    async fn validate(&self, token: &str) -> Result<TokenClaims, CoreError> {
        self(token.to_string()).await
    }
}

/// Forwards a client chat send onto a `ChannelService` without tying the
/// transport to a concrete storage backend.
#[async_trait::async_trait]
pub trait ChannelGateway: Send + Sync + 'static {
    async fn send_message(
        &self,
        caller: Caller,
        channel: ChannelId,
        content: String,
        sender_id: UserId,
        username: String,
    ) -> Result<(), CoreError>;
}

#[async_trait::async_trait]
impl<S: ChannelStorage> ChannelGateway for ChannelService<S> {
    async fn send_message(
        &self,
        caller: Caller,
        channel: ChannelId,
        content: String,
        sender_id: UserId,
        username: String,
    ) -> Result<(), CoreError> {
        self.send(caller, channel, content, sender_id, username, true)
            .await
            .map(|_| ())
    }
}

/// Everything the upgrade handler needs, shared across connections.
pub struct TransportState {
    pub sessions: Arc<SessionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub matches: Arc<MatchRegistry>,
    pub channels: Arc<dyn ChannelGateway>,
    pub token_validator: Arc<dyn TokenValidator>,
    pub session_config: SessionConfig,
    /// Spec §4.1 "Single-socket policy".
    pub single_socket: bool,
}

#[derive(Debug, serde::Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub format: Option<String>,
}

/// `GET /ws?token=...&format=binary|text` — the single upgrade route this
/// crate exposes (spec §6: everything else is HTTP/gRPC surface, a
/// Non-goal).
pub async fn upgrade(
    State(state): State<Arc<TransportState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let format = match Format::parse_query_param(query.format.as_deref()) {
        Ok(format) => format,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let Some(token) = bearer_token(&headers, query.token.as_deref()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match state.token_validator.validate(&token).await {
        Ok(claims) => claims,
        Err(err) => {
            debug!(%err, "rejecting connection: token validation failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    if claims.expiry <= now_epoch_secs() {
        debug!(user_id = %claims.user_id, "rejecting connection: expired token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims, format, remote_addr))
}

fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(rest) = value.strip_prefix("Bearer ") {
            return Some(rest.to_string());
        }
    }
    query_token.map(ToOwned::to_owned)
}

struct AxumWriteSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl WriteSink for AxumWriteSink {
    async fn write_frame(&mut self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.sink.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    async fn write_ping(&mut self) -> anyhow::Result<()> {
        self.sink.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn close(&mut self, _reason: &str) {
        let _ = self.sink.close().await;
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<TransportState>,
    claims: TokenClaims,
    format: Format,
    remote_addr: SocketAddr,
) {
    let (ws_sink, mut ws_stream) = socket.split();
    let session_id: SessionId = crate::ids::new_id();

    let session = Session::spawn(
        session_id,
        claims.user_id,
        claims.username.clone(),
        format,
        claims.expiry,
        remote_addr.to_string(),
        claims.vars.clone(),
        state.session_config.clone(),
        AxumWriteSink { sink: ws_sink },
    );

    state.sessions.add(session.clone(), state.single_socket);
    info!(%session_id, user_id = %claims.user_id, %remote_addr, "session connected");

    let cancellation = session.cancellation_token();
    // Read deadline: dropped if nothing, including a pong, is heard from
    // the peer for two ping intervals (spec §6 "pong extends read
    // deadline").
    let read_deadline = tokio::time::sleep(state.session_config.ping_interval * 2);
    tokio::pin!(read_deadline);

    loop {
        tokio::select! {
            () = &mut read_deadline => {
                warn!(%session_id, "read deadline exceeded, closing session");
                break;
            }
            () = cancellation.cancelled() => {
                break;
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        read_deadline.as_mut().reset(tokio::time::Instant::now() + state.session_config.ping_interval * 2);
                        dispatch_inbound(&state, &session, &data).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        read_deadline.as_mut().reset(tokio::time::Instant::now() + state.session_config.ping_interval * 2);
                        dispatch_inbound(&state, &session, text.as_bytes()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        read_deadline.as_mut().reset(tokio::time::Instant::now() + state.session_config.ping_interval * 2);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        read_deadline.as_mut().reset(tokio::time::Instant::now() + state.session_config.ping_interval * 2);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(%session_id, %err, "websocket read error, closing session");
                        break;
                    }
                }
            }
        }
    }

    state.sessions.remove(session_id);
    state.presence.untrack_session(session_id);
    session.close("connection closed");
    info!(%session_id, "session disconnected");
}

/// `Session::consume` hands the decoded envelope to a synchronous closure,
/// so the closure here only lifts it out; the actual (async) routing runs
/// after `consume` returns.
async fn dispatch_inbound(state: &TransportState, session: &Session, raw: &[u8]) {
    let mut captured: Option<Envelope> = None;
    if let Err(err) = session.consume(raw, |_session, envelope| captured = Some(envelope)) {
        debug!(session_id = %session.id, %err, "dropping malformed inbound frame");
        return;
    }
    let Some(envelope) = captured else { return };

    match envelope.body {
        EnvelopeBody::Ping => {
            session.send(
                &Envelope {
                    cid: envelope.cid,
                    body: EnvelopeBody::Pong,
                },
                true,
            );
        }
        EnvelopeBody::Pong => {}
        EnvelopeBody::MatchData {
            match_id,
            op_code,
            payload,
            reliable,
            ..
        } => {
            route_match_data(state, session, match_id, op_code, payload, reliable).await;
        }
        EnvelopeBody::ChannelMessage {
            stream_mode,
            subject,
            subcontext,
            label,
            content,
        } => {
            route_channel_message(state, session, stream_mode, subject, subcontext, label, content).await;
        }
        EnvelopeBody::Notification { .. } | EnvelopeBody::Error { .. } => {
            debug!(session_id = %session.id, "ignoring server-to-client-only envelope kind from a client");
        }
    }
}

fn authoritative_or_relayed_stream(match_id: &MatchId) -> Stream {
    if match_id.is_authoritative() {
        Stream::new(StreamMode::MatchAuthoritative, match_id.to_string())
    } else {
        Stream::new(StreamMode::MatchRelayed, match_id.to_string())
    }
}

async fn route_match_data(
    state: &TransportState,
    session: &Session,
    match_id: MatchId,
    op_code: i64,
    payload: Vec<u8>,
    reliable: bool,
) {
    if match_id.is_authoritative() {
        let message = MatchDataMessage {
            sender: Some(session.id),
            op_code,
            payload,
            reliable,
        };
        if let Err(err) = state.matches.send_data(&match_id, message) {
            debug!(%match_id, %err, "dropping match data for unknown match");
        }
    } else {
        let stream = authoritative_or_relayed_stream(&match_id);
        let envelope = Envelope {
            cid: None,
            body: EnvelopeBody::MatchData {
                match_id,
                op_code,
                payload,
                reliable,
                sender_session_id: Some(session.id),
            },
        };
        let router = Router::new(&state.sessions, &state.presence);
        router.send_to_stream(&stream, &envelope, reliable);
    }
}

async fn route_channel_message(
    state: &TransportState,
    session: &Session,
    stream_mode: u8,
    subject: String,
    subcontext: String,
    label: String,
    content: String,
) {
    let canonical = format!("{stream_mode}.{subject}.{subcontext}.{label}");
    let channel: ChannelId = match canonical.parse() {
        Ok(channel) => channel,
        Err(err) => {
            debug!(session_id = %session.id, %err, "rejecting inbound channel message: invalid channel id");
            return;
        }
    };

    if let Err(err) = state
        .channels
        .send_message(Caller::User(session.user_id), channel, content, session.user_id, session.username())
        .await
    {
        debug!(session_id = %session.id, %err, "channel send failed");
    }
}
