//! HTTP server bootstrap. Routes live in [`crate::gating::web`].
use crate::gating::web::{router, GatingState};
use crate::settings::Settings;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::Router;
use miette::IntoDiagnostic;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

// Decisions are per learner and change with progress; nothing in between
// may keep a copy.
async fn response_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    response
}

/// Full application router with middleware applied.
pub fn app(state: Arc<GatingState>) -> Router {
    router(state)
        .layer(middleware::from_fn(response_headers))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(settings: &Settings, state: Arc<GatingState>) -> miette::Result<()> {
    let addr: SocketAddr = settings
        .bind_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Gating API listening");
    axum::serve(listener, app(state)).await.into_diagnostic()?;
    Ok(())
}
