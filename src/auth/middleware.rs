use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::S3Error;
use crate::server::AppState;

/// Access-key check for AWS-style clients. Only the key prefix of the
/// `Credential=` parameter is compared; the signature itself is not
/// verified.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, S3Error> {
    if !state.config.enable_auth {
        return Ok(next.run(request).await);
    }

    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| S3Error::access_denied("Missing Authorization header"))?;

    let access_key = parse_access_key(header)
        .ok_or_else(|| S3Error::access_denied("Unsupported authorization type"))?;

    if access_key != state.config.access_key_id {
        tracing::debug!(
            "access key mismatch: got '{}', expected '{}'",
            access_key,
            state.config.access_key_id
        );
        return Err(S3Error::access_denied("Invalid access key"));
    }

    Ok(next.run(request).await)
}

fn parse_access_key(header: &str) -> Option<&str> {
    let params = header.strip_prefix("AWS4-HMAC-SHA256 ")?;
    for param in params.split(',') {
        if let Some(credential) = param.trim().strip_prefix("Credential=") {
            return credential.split('/').next();
        }
    }
    None
}
