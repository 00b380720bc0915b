use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::api::payloads::ErrorPayload;
use crate::api::ApiState;

/// Authentication policy of the control API.
#[derive(Debug, Clone)]
pub enum ApiAuthentication {
    /// Every request is accepted.
    None,
    /// RFC 7617 basic auth against one static credential pair.
    StaticBasic { username: String, password: String },
}

/// Router-wide middleware enforcing the configured policy.
pub async fn require_authentication(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    match &state.auth {
        ApiAuthentication::None => next.run(request).await,
        ApiAuthentication::StaticBasic { username, password } => {
            match basic_credentials(request.headers()) {
                Some((user, pass)) if &user == username && &pass == password => {
                    next.run(request).await
                }
                _ => unauthorized(),
            }
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
        Json(ErrorPayload {
            error: "Unauthorized".to_string(),
        }),
    )
        .into_response()
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
