//! Request guards: HTTP basic auth and the OSBAPI version header.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;

use super::handlers::error_body;
use super::state::{AppState, Credentials};

/// Timeout for the administrative routes. OSBAPI routes are not limited
/// since bind and unbind wait for the tool.
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);

pub const API_VERSION_HEADER: &str = "X-Broker-API-Version";
const MIN_API_VERSION: (u32, u32) = (2, 13);

pub async fn basic_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.credentials.enabled() || authorized(req.headers(), &state.credentials) {
        return next.run(req).await;
    }
    tracing::warn!(path = %req.uri().path(), "rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"tofu-broker\"")],
        error_body(None, "unauthorized"),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap, creds: &Credentials) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == creds.username && pass == creds.password,
        None => false,
    }
}

pub async fn api_version(req: Request, next: Next) -> Response {
    let version = req
        .headers()
        .get(API_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_version);
    match version {
        Some(v) if v >= MIN_API_VERSION => next.run(req).await,
        _ => (
            StatusCode::PRECONDITION_FAILED,
            error_body(
                None,
                &format!(
                    "{API_VERSION_HEADER} header must be at least {}.{}",
                    MIN_API_VERSION.0, MIN_API_VERSION.1
                ),
            ),
        )
            .into_response(),
    }
}

fn parse_version(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions() {
        assert_eq!(parse_version("2.14"), Some((2, 14)));
        assert!(parse_version("2.12").unwrap() < MIN_API_VERSION);
        assert!(parse_version("3.0").unwrap() > MIN_API_VERSION);
        assert_eq!(parse_version("two"), None);
    }

    #[test]
    fn basic_auth_header() {
        let creds = Credentials {
            username: "broker".into(),
            password: "secret".into(),
        };
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, &creds));
        let token = base64::engine::general_purpose::STANDARD.encode("broker:secret");
        headers.insert(header::AUTHORIZATION, format!("Basic {token}").parse().unwrap());
        assert!(authorized(&headers, &creds));
        let token = base64::engine::general_purpose::STANDARD.encode("broker:wrong");
        headers.insert(header::AUTHORIZATION, format!("Basic {token}").parse().unwrap());
        assert!(!authorized(&headers, &creds));
    }
}
