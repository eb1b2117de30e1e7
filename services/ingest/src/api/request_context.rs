//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use lotacao_events::ActorType;
use lotacao_id::RequestId;
use sha2::{Digest, Sha256};

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// The request id set by the request-id layer, or a fresh one.
pub fn request_id(headers: &HeaderMap) -> String {
    header_string(headers, REQUEST_ID_HEADER).unwrap_or_else(|| RequestId::new().to_string())
}

/// Resolves the operator behind an administrative call.
///
/// `operator:<id>` tokens name the operator directly; any other token maps to
/// a stable hashed id so tokens never reach the audit log.
fn actor_from_authorization_header(
    headers: &HeaderMap,
    request_id: &str,
) -> Result<Option<(ActorType, String)>, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Ok(None);
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::bad_request(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        )
        .with_request_id(request_id.to_string()));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_authorization",
            "Authorization Bearer token cannot be empty",
        )
        .with_request_id(request_id.to_string()));
    }

    if let Some(operator) = token.strip_prefix("operator:") {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(ApiError::bad_request(
                "invalid_token",
                "operator token must be in the form 'operator:<id>'",
            )
            .with_request_id(request_id.to_string()));
        }
        return Ok(Some((ActorType::Operator, operator.to_string())));
    }

    let digest = Sha256::digest(token.as_bytes());
    let hex = format!("{:x}", digest);
    let short = hex.get(..32).unwrap_or(&hex);

    Ok(Some((ActorType::Operator, format!("op_{short}"))))
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(&parts.headers);

        let (actor_type, actor_id) =
            actor_from_authorization_header(&parts.headers, &request_id)?
                .unwrap_or((ActorType::System, "system".to_string()));

        Ok(Self {
            request_id,
            actor_type,
            actor_id,
        })
    }
}
