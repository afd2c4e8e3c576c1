//! JWT authentication. The credential carries the tenant's biz id; every
//! authenticated request gets a [`TenantIdentity`] extension.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::server::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant identifier.
    pub biz_id: i64,
    /// Expiry, seconds since epoch.
    pub exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// The authenticated tenant, attached to the request.
#[derive(Debug, Clone, Copy)]
pub struct TenantIdentity {
    pub biz_id: i64,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Auth("missing authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Auth("authorization header must be a bearer token".into()))?;

    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(issuer) = &state.jwt.issuer {
        validation.set_issuer(&[issuer]);
    }
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt.secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AppError::Auth(format!("invalid token: {e}")))?;

    if decoded.claims.biz_id <= 0 {
        return Err(AppError::Auth("token carries no tenant identity".into()));
    }

    request.extensions_mut().insert(TenantIdentity {
        biz_id: decoded.claims.biz_id,
    });
    Ok(next.run(request).await)
}
