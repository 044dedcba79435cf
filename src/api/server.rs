use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{
    services::{
        cancel_task, content_tasks, create_task, delete_task, foreground, get_task, health,
        list_tasks, metrics, pause_task, purge, resume_task, retry_task, set_network,
    },
    state::AppState,
};
use crate::config::Config;
use crate::manager::DownloadManager;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Control API routes over a running manager
pub fn router(state: AppState) -> Router {
    let max_inflight = state.config.server.max_inflight_requests;

    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/pause", post(pause_task))
        .route("/tasks/{id}/resume", post(resume_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/contents/{identifier}/tasks", get(content_tasks))
        .route("/network", put(set_network))
        .route("/events/foreground", post(foreground))
        .route("/maintenance/purge", post(purge))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(max_inflight))
        .layer(TraceLayer::new_for_http())
}

/// Start the manager and serve the control API until Ctrl+C or SIGTERM,
/// then shut the manager down so running transfers are requeued
pub async fn run(config: Config, address: Option<SocketAddr>) -> Result<(), AnyError> {
    let address = address.unwrap_or(config.server.bind_addr);

    info!(path = %config.server.data_dir.display(), "Opening task store");
    let manager: Arc<DownloadManager> = DownloadManager::open(&config)
        .await
        .map_err(|e| format!("Failed to start download manager: {}", e))?;

    let app = router(AppState::new(config, manager.clone()));

    let listener = TcpListener::bind(address).await?;
    info!(%address, "tidefetch API listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = manager.shutdown().await {
        error!(error = %e, "Download manager did not shut down cleanly");
    }
    served?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
