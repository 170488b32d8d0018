// ABOUTME: HTTP and WebSocket front door for the session manager
// Builds the axum router over the shared services and drives graceful shutdown

pub mod api;
pub mod ws;

use crate::config::ServerConfig;
use crate::services::Services;
use anyhow::{Context, Result};
use axum::{extract::DefaultBodyLimit, http::HeaderValue, routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Upper bound on request bodies, large enough for whole-file saves
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    /// Flips to `true` once the server begins shutting down; open sockets close on it
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(services: Arc<Services>, shutdown: watch::Receiver<bool>) -> Self {
        Self { services, shutdown }
    }
}

/// Build the full application router with the file API and the session socket.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.services.config.server);

    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve until `signal` resolves, then close every socket and wait for in-flight requests.
pub async fn serve<F>(listener: TcpListener, services: Arc<Services>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = build_router(AppState::new(services, shutdown_rx));

    let local_addr = listener.local_addr()?;
    info!("Sandbox hub listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutdown requested, closing sessions");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::docker::MockDriver;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router(config: AppConfig) -> (Router, watch::Sender<bool>) {
        let services = Arc::new(Services::new(config, Arc::new(MockDriver::new())));
        let (tx, rx) = watch::channel(false);
        (build_router(AppState::new(services, rx)), tx)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _tx) = test_router(AppConfig::default());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (app, _tx) = test_router(AppConfig::default());
        let resp = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_origin_list_is_enforced() {
        let mut config = AppConfig::default();
        config.server.cors_origins = vec!["http://allowed.test".to_string()];
        let (app, _tx) = test_router(config);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://allowed.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://allowed.test"
        );

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://other.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_permissive_cors_by_default() {
        let (app, _tx) = test_router(AppConfig::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://anywhere.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }
}
