pub mod auth;
pub mod hub;
pub mod rest_api;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, Method};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;

use crate::auth::{Authenticator, FirstUseAuthenticator};
use crate::hub::{Hub, HubConfig};
use crate::server::session::ServerSession;

#[derive(Parser, Debug)]
#[clap(name = "peerview-gateway")]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    #[clap(long, default_value_t = 8000, env)]
    http_listen_port: u16,
    /// Evict participants silent for longer than this.
    #[clap(long, default_value_t = 2000, env)]
    heartbeat_timeout_ms: u64,
    #[clap(long, default_value_t = 250, env)]
    sweep_interval_ms: u64,
    /// Upper bound for handing one event to one participant.
    #[clap(long, default_value_t = 500, env)]
    delivery_timeout_ms: u64,
    /// Buffered events per connection and direction.
    #[clap(long, default_value_t = 32, env)]
    channel_capacity: usize,
    #[clap(long, default_value_t = true, env, action = clap::ArgAction::Set)]
    echo_chat_to_sender: bool,
}

impl Config {
    pub fn hub_config(&self) -> anyhow::Result<HubConfig> {
        anyhow::ensure!(
            self.heartbeat_timeout_ms > 0 && self.sweep_interval_ms > 0 && self.delivery_timeout_ms > 0,
            "timeouts and intervals must be positive"
        );
        anyhow::ensure!(
            self.sweep_interval_ms < self.heartbeat_timeout_ms,
            "sweep interval ({}ms) must be shorter than the heartbeat timeout ({}ms)",
            self.sweep_interval_ms,
            self.heartbeat_timeout_ms
        );
        Ok(HubConfig {
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            echo_chat_to_sender: self.echo_chat_to_sender,
        })
    }

    pub fn transport_config(&self) -> anyhow::Result<TransportConfig> {
        anyhow::ensure!(self.channel_capacity > 0, "channel capacity must be positive");
        Ok(TransportConfig {
            channel_capacity: self.channel_capacity,
            send_timeout: Duration::from_millis(self.delivery_timeout_ms),
        })
    }
}

/// Per-connection socket settings.
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    pub channel_capacity: usize,
    pub send_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            send_timeout: Duration::from_millis(500),
        }
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let hub = Hub::new(config.hub_config()?);
    let transport = config.transport_config()?;
    let tcp_addr = SocketAddr::from(([0, 0, 0, 0], config.http_listen_port));
    let listener = TcpListener::bind(tcp_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    let _background = hub.spawn_background();
    let state = AppState::new(hub, Arc::new(FirstUseAuthenticator::new()), transport);
    serve(listener, state).await
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws/:username", axum::routing::get(websocket_handler))
        .route("/api/login", axum::routing::post(rest_api::login))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let router = router(state);
    axum::Server::from_tcp(listener.into_std()?)?
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

#[derive(Clone)]
pub struct AppState {
    hub: Hub,
    auth: Arc<dyn Authenticator>,
    transport: TransportConfig,
}

impl AppState {
    pub fn new(hub: Hub, auth: Arc<dyn Authenticator>, transport: TransportConfig) -> Self {
        Self {
            hub,
            auth,
            transport,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

async fn websocket_handler(
    Path(username): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl axum::response::IntoResponse {
    let ws_span = tracing::info_span!(parent: None, "session", identity = %username);
    ws.on_upgrade(move |socket| {
        async move {
            if let Err(e) = handle_session(socket, username, state).await {
                tracing::warn!("session ended with error: {}", e);
            } else {
                tracing::info!("session ended");
            }
        }
        .instrument(ws_span)
    })
}

async fn handle_session(socket: WebSocket, username: String, state: AppState) -> anyhow::Result<()> {
    ServerSession::init_websocket(socket, username, state.hub, state.transport)
        .await
        .run_session()
        .await
}

#[cfg(test)]
fn test_log() {
    use tracing_subscriber::prelude::*;
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::EnvFilter::new(
                    std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".into()),
                ))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_line_number(true)
                        .with_file(true),
                ),
        );
        let _ = tracing_log::LogTracer::init();
    }
}
