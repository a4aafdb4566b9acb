//! Process-level HTTP wiring: startup loading, middleware and the listener.
//! Routes and handlers live in `authz::web`.
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use miette::IntoDiagnostic;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::authz::loader;
use crate::authz::web::{router, DecisionService};
use crate::errors::CanopyError;
use crate::settings::Settings;

/// Build the service from the configured files. A missing entities file or
/// policies directory leaves that half unloaded (the API answers 503 until it
/// is posted); a present but invalid one is a startup error.
pub async fn load_service(settings: &Settings) -> Result<DecisionService, CanopyError> {
    let service = DecisionService::new();

    let entities_path = &settings.data.entities_path;
    if entities_path.exists() {
        let store = loader::load_entities(entities_path)?;
        service
            .replace_entities(store, settings.resolver.warm_cache)
            .await;
    } else {
        tracing::warn!(path = %entities_path.display(), "Entities file not found; waiting for POST /entities");
    }

    let policies_dir = &settings.data.policies_dir;
    if policies_dir.is_dir() {
        let store = loader::load_policies(policies_dir)?;
        service.replace_policies(store).await;
    } else {
        tracing::warn!(path = %policies_dir.display(), "Policies directory not found; waiting for POST /policies");
    }

    Ok(service)
}

/// The full application: routes plus tracing and request timeout layers.
pub fn app(service: DecisionService, settings: &Settings) -> Router {
    with_middleware(router(service), settings)
}

fn with_middleware(routes: Router, settings: &Settings) -> Router {
    routes
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(settings.server.request_timeout_secs),
        ))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(settings: Settings) -> miette::Result<()> {
    let service = load_service(&settings).await?;

    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Canopy decision service listening");

    serve_with_shutdown(listener, app(service, &settings), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await
}

pub async fn serve_with_shutdown(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> miette::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .into_diagnostic()
}
