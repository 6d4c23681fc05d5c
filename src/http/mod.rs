//! REST facade (`[AMBIENT]`): an `axum::Router` addressed directly to
//! [`ServerContext`] operations, the way the teacher's `adapters::http`
//! wires its network listeners but without the generic pipeline/endpoint
//! indirection that domain has no counterpart for here.

mod archive;
mod auth;
mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::ServerContext;

pub use error::ApiError;

pub fn build_router(context: Arc<ServerContext>) -> Router {
    let resource_routes = Router::new()
        .route("/{kind}/{id}", get(handlers::get_resource).delete(handlers::delete_resource))
        .route("/{kind}/{id}/archive", get(handlers::get_archive))
        .route("/{kind}/{id}/modify", post(handlers::modify_resource))
        .route("/{kind}/{id}/anonymize", post(handlers::anonymize_resource))
        .route("/{kind}/{id}/attachments", get(handlers::list_attachments))
        .route("/{kind}/{id}/attachments/{name}", get(handlers::get_attachment).put(handlers::put_attachment))
        .route("/{kind}/{id}/metadata", get(handlers::list_metadata))
        .route(
            "/{kind}/{id}/metadata/{name}",
            get(handlers::get_metadata).put(handlers::put_metadata).delete(handlers::delete_metadata),
        );

    let router = Router::new()
        .route("/system", get(handlers::system))
        .route("/statistics", get(handlers::statistics))
        .route("/tools/now", get(handlers::now))
        .route("/tools/generate-uid", get(handlers::generate_uid))
        .route("/tools/execute-script", post(handlers::execute_script))
        .route("/tools/create-dicom", post(handlers::create_dicom))
        .route("/changes", get(handlers::get_changes).delete(handlers::clear_changes))
        .route("/exports", get(handlers::get_exports).delete(handlers::clear_exports))
        .merge(resource_routes)
        .with_state(context.clone());

    if context.config.authentication_enabled {
        router.layer(axum::middleware::from_fn_with_state(context, auth::basic_auth))
    } else {
        router
    }
}

/// Serve the REST facade until `shutdown` is cancelled.
pub async fn serve(config: &Config, context: Arc<ServerContext>, shutdown: CancellationToken) -> std::io::Result<()> {
    let router = build_router(context);
    let bind_host = if config.remote_access_allowed { "0.0.0.0" } else { "127.0.0.1" };
    let addr: SocketAddr = format!("{bind_host}:{}", config.http_port).parse().expect("valid bind address");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP facade listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
