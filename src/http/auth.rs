//! HTTP Basic authentication against `Config::registered_users`, the fixed
//! contract the facade names (no JWT/JWKS machinery: this domain has no
//! token issuer to federate with).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose, Engine as _};

use crate::context::ServerContext;

fn unauthorized() -> Response {
    let mut response = StatusCode::UNAUTHORIZED.into_response();
    response.headers_mut().insert(
        "WWW-Authenticate",
        HeaderValue::from_static("Basic realm=\"orthanc\""),
    );
    response
}

pub async fn basic_auth(State(context): State<Arc<ServerContext>>, request: Request, next: Next) -> Response {
    let Some(header) = request.headers().get("Authorization") else {
        return unauthorized();
    };
    let Ok(header) = header.to_str() else {
        return unauthorized();
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return unauthorized();
    };
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded) else {
        return unauthorized();
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized();
    };
    let Some((username, password)) = credentials.split_once(':') else {
        return unauthorized();
    };

    match context.config.registered_users.get(username) {
        Some(expected) if expected == password => next.run(request).await,
        _ => unauthorized(),
    }
}
