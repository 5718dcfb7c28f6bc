use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC of an authority request body.
pub const SIGNATURE_HEADER: &str = "x-realm-signature";

/// Admin surface credentials.
#[derive(Clone, Default)]
pub struct AdminAuth {
    /// Bearer token for admin routes. None = every admin request is refused.
    pub bearer_token: Option<String>,
}

/// Axum middleware that validates the admin bearer token.
pub async fn bearer_auth_middleware(
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth = request
        .extensions()
        .get::<AdminAuth>()
        .cloned()
        .unwrap_or_default();

    let Some(expected) = auth.bearer_token else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => {
            tracing::warn!("Rejected admin request with bad credentials");
            Err(StatusCode::UNAUTHORIZED)
        },
    }
}

/// HMAC-SHA256 signature of `body`, formatted as `sha256=<hex>`.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
