use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    hub::Hub,
    session::{Route, Session, SessionConfig},
    transport::Transport,
};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub session: SessionConfig,
}

pub struct RelayServer {
    listener: TcpListener,
    state: AppState,
}

impl RelayServer {
    pub fn new(listener: TcpListener, hub: Arc<Hub>, session: SessionConfig) -> Self {
        Self {
            listener,
            state: AppState { hub, session },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    /// Serves until `shutdown` resolves, then closes every relayed session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer { listener, state } = self;
        let hub = Arc::clone(&state.hub);
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                handle_shutdown(&hub);
            })
            .await?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(hub: &Hub) {
    info!("relay shutting down");
    hub.shutdown();
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(websocket))
        .route("/", get(liveness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn websocket(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            let message = format!("upgrade connection to websocket failed: {rejection}");
            warn!("{message}");
            return (StatusCode::BAD_REQUEST, Json(message)).into_response();
        }
    };

    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    upgrade.on_upgrade(move |socket| relay_connection(socket, peer, state))
}

async fn relay_connection(socket: WebSocket, peer: Option<SocketAddr>, state: AppState) {
    let mut transport = Transport::from_axum(socket);
    if let Some(peer) = peer {
        transport = transport.with_peer(peer);
    }

    let session = Session::new(transport, state.session.clone());
    match session.start(Route::Hub(Arc::clone(&state.hub))) {
        Ok(tasks) => {
            info!(session = %session.id(), ?peer, "client connected");
            tasks.join().await;
        }
        Err(err) => warn!(error = %err, "failed to start session"),
    }
}

#[derive(Debug, Deserialize)]
struct LivenessQuery {
    message: Option<String>,
}

async fn liveness(Query(query): Query<LivenessQuery>) -> Json<String> {
    let message = query
        .message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| "ok".to_string());
    info!(%message, "liveness probe");
    Json(message)
}
