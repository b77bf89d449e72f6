//! The tagged invocation-mode surface user code plugs into (spec §9
//! "Dynamic dispatch to user code").

use serde_json::Value as Json;

use crate::ids::UserId;

/// Minimal caller context handed to every invocation. Kept deliberately
/// thin — user code reaches back into the host through its own return
/// value, not through side-channel mutation of this struct.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub user_id: Option<UserId>,
    pub username: Option<String>,
}

/// One call into user code, tagged by the mode that triggered it (spec
/// §9: "RPC, BeforeRequest, AfterRequest, MatchHandler, TournamentEnd,
/// TournamentReset, LeaderboardReset, MatchmakerMatched,
/// PurchaseNotification").
#[derive(Debug, Clone)]
pub enum InvocationMode {
    Rpc { id: String, payload: Json },
    BeforeRequest { method: String, payload: Json },
    AfterRequest { method: String, payload: Json },
    MatchHandlerInit { short_name: String, params: Json },
    TournamentEnd { leaderboard_id: String },
    TournamentReset { leaderboard_id: String },
    LeaderboardReset { leaderboard_id: String },
    MatchmakerMatched { ticket_ids: Vec<String> },
    PurchaseNotification { receipt: Json },
}

impl InvocationMode {
    /// The registration key a handler is looked up by — the bare RPC id
    /// or method name for the request hooks, a fixed name per mode
    /// otherwise (there is at most one handler per non-keyed mode).
    pub fn registration_key(&self) -> String {
        match self {
            InvocationMode::Rpc { id, .. } => format!("rpc:{id}"),
            InvocationMode::BeforeRequest { method, .. } => format!("before:{method}"),
            InvocationMode::AfterRequest { method, .. } => format!("after:{method}"),
            InvocationMode::MatchHandlerInit { short_name, .. } => format!("match:{short_name}"),
            InvocationMode::TournamentEnd { .. } => "tournament_end".to_string(),
            InvocationMode::TournamentReset { .. } => "tournament_reset".to_string(),
            InvocationMode::LeaderboardReset { .. } => "leaderboard_reset".to_string(),
            InvocationMode::MatchmakerMatched { .. } => "matchmaker_matched".to_string(),
            InvocationMode::PurchaseNotification { .. } => "purchase_notification".to_string(),
        }
    }

    pub fn payload(&self) -> Json {
        match self {
            InvocationMode::Rpc { payload, .. }
            | InvocationMode::BeforeRequest { payload, .. }
            | InvocationMode::AfterRequest { payload, .. } => payload.clone(),
            InvocationMode::MatchHandlerInit { params, .. } => params.clone(),
            InvocationMode::TournamentEnd { leaderboard_id }
            | InvocationMode::TournamentReset { leaderboard_id }
            | InvocationMode::LeaderboardReset { leaderboard_id } => Json::String(leaderboard_id.clone()),
            InvocationMode::MatchmakerMatched { ticket_ids } => {
                Json::Array(ticket_ids.iter().cloned().map(Json::String).collect())
            }
            InvocationMode::PurchaseNotification { receipt } => receipt.clone(),
        }
    }
}

/// A user-code failure, stripped of source location before it crosses the
/// host boundary (spec §7 "user-code errors become `RuntimeFunctionException`
/// carrying the message... and an optional status code").
#[derive(Debug, Clone)]
pub struct RuntimeCallError {
    pub message: String,
    pub status: Option<i32>,
}

impl RuntimeCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: i32) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

#[async_trait::async_trait]
pub trait RuntimeFunction: Send + Sync + 'static {
    async fn call(&self, ctx: RuntimeContext, payload: Json) -> Result<Json, RuntimeCallError>;
}

#[async_trait::async_trait]
impl<F, Fut> RuntimeFunction for F
where
    F: Fn(RuntimeContext, Json) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Json, RuntimeCallError>> + Send + 'static,
{
    async fn call(&self, ctx: RuntimeContext, payload: Json) -> Result<Json, RuntimeCallError> {
        self(ctx, payload).await
    }
}
