//! HTTP and WebSocket surface.

pub mod routes;
pub mod ws;

use axum::Router;
use axum::routing::{delete, get, post, put};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AuthService;
use crate::config::WebSocketConfig;
use crate::registry::ConnectionRegistry;
use crate::service::TaskService;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub tasks: Arc<TaskService>,
    pub registry: Arc<ConnectionRegistry>,
    pub websocket: WebSocketConfig,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        // Auth
        .route("/auth/register", post(routes::register))
        .route("/auth/login", post(routes::login))
        .route("/auth/me", get(routes::me))
        // Tasks
        .route("/tasks/create", post(routes::create_task))
        .route("/tasks/update/{task_id}", put(routes::update_task))
        .route("/tasks/delete/{task_id}", delete(routes::delete_task))
        .route("/tasks/user/tasks", get(routes::user_tasks))
        .route("/tasks/all", get(routes::all_tasks))
        // Push channel
        .route("/websocket/ws/{user_id}", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Server task panicked");
        }
    }
}

/// Bind and serve in a background task.
pub async fn start_server(state: AppState, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Listening on http://{}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("HTTP server shutting down");
            })
            .await
        {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    Ok(ServerHandle {
        addr: bound_addr,
        shutdown_tx,
        task,
    })
}
