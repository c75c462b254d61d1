//! Request signature verification and response signing

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use super::AppState;
use crate::signing::Signer;

/// `HashSHA256`, normalised the way `http` stores header names
pub const SIGNATURE: HeaderName = HeaderName::from_static("hashsha256");

/// Largest request body buffered for verification
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Verify signed requests and sign every response
///
/// Does nothing when no secret is configured. A request without the header
/// passes unchecked; one whose header does not match the raw body is
/// rejected with 400 before any handler runs.
pub async fn signature(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(signer) = state.signer.clone() else {
        return next.run(request).await;
    };

    let request = match verify_request(&signer, request).await {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    let response = next.run(request).await;
    sign_response(&signer, response).await
}

async fn verify_request(signer: &Signer, request: Request) -> Result<Request, Response> {
    let Some(header) = request.headers().get(&SIGNATURE) else {
        return Ok(request);
    };
    let Ok(signature) = header.to_str().map(str::to_owned) else {
        return Err((StatusCode::BAD_REQUEST, "Invalid hash format").into_response());
    };

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to read request body");
            return Err(
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read request body").into_response(),
            );
        }
    };

    if let Err(e) = signer.verify(&body, &signature) {
        warn!(path = %parts.uri.path(), error = %e, "Rejected request with bad signature");
        return Err((StatusCode::BAD_REQUEST, "Invalid hash").into_response());
    }

    debug!(path = %parts.uri.path(), "Request signature verified");
    Ok(Request::from_parts(parts, Body::from(body)))
}

async fn sign_response(signer: &Signer, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to buffer response body for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Ok(value) = HeaderValue::from_str(&signer.sign(&body)) {
        parts.headers.insert(SIGNATURE, value);
    }
    Response::from_parts(parts, Body::from(body))
}
