use std::net::SocketAddr;
use std::sync::Arc;

use arcadia_core::auth::{JwtConfig, JwtTokenValidator};
use arcadia_core::leaderboard::ResetScheduler;
use arcadia_core::runtime::Runtime;
use arcadia_core::session::SessionConfig;
use arcadia_core::{build_router, Core};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7350))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // The Extension Runtime's handlers are registered here, before the
    // first connection is accepted (spec §9: "registration API during
    // init only" — once built, a `Runtime` cannot gain another handler).
    // A deployment with real match/RPC logic plugs its handlers into this
    // builder; none are registered here, so the server boots with the
    // wire protocol, sessions, matches and channels live and no scripted
    // behavior beyond what each subsystem does on its own.
    let runtime = Runtime::builder().build();

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let core = Core::new(runtime, tracker.clone());

    // Drives LeaderboardReset/TournamentEnd/TournamentReset (spec §4.5
    // "Reset events") — without this, reset schedules are computed
    // (`current_partition`) but nothing ever invokes the runtime handlers.
    let reset_scheduler = ResetScheduler::new(core.leaderboards.clone(), core.runtime.clone(), tracker.clone(), token.clone());
    reset_scheduler.start();

    // `AUTH_SECRET`/`AUTH_PUBLIC_KEY_PEM` is this crate's one unavoidable
    // env read, the same way the teacher cannot default `DATABASE_URL` — a
    // signing key cannot have a built-in default. Everything else below
    // uses the `Default`-able config structs config loading would
    // eventually populate (spec's Non-goals exclude that loader itself).
    let jwt_config = JwtConfig::from_env().expect(
        "set AUTH_SECRET (HS256) or AUTH_PUBLIC_KEY_PEM (RS256) so inbound session tokens can be validated",
    );
    let token_validator = Arc::new(JwtTokenValidator::new(jwt_config));

    let transport_state = core.transport_state(token_validator, SessionConfig::default(), true);
    let router = build_router(transport_state).into_make_service_with_connect_info::<SocketAddr>();

    tracker.spawn({
        let token = token.clone();
        let bind_addr = bind_addr();
        info!(%bind_addr, "websocket server listening");
        let listener = TcpListener::bind(bind_addr).await.expect("failed to bind websocket listener");
        let serve = axum::serve(listener, router);

        async move {
            tokio::select! {
                result = serve => {
                    result.expect("websocket server exited with an error");
                }
                () = token.cancelled() => {}
            }
        }
    });

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("shutting down...");

    token.cancel();
    tracker.close();
    tracker.wait().await;
}
