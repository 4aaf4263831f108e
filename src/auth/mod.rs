//! Bearer-token authentication
//!
//! Tokens are minted by the identity service and verified here against the
//! shared HMAC secret. The gateway never issues tokens; it only checks them
//! and attaches the verified identity to the request for downstream
//! authorization decisions.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::envelope::GatewayError;
use crate::proxy::AppState;

/// Claim set carried by identity-service tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id of the authenticated user
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// Verified identity attached to the request context
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            roles: claims.roles,
        }
    }
}

/// Authentication middleware for protected routes. Missing credentials are
/// `unauthorized`; present-but-unverifiable credentials are `invalid_token`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| GatewayError::Unauthorized("No token provided".to_string()))?;

    let claims = verify_token(&token, &state.config.auth.jwt_secret).map_err(|err| {
        tracing::warn!(error = %err, "invalid token");
        GatewayError::InvalidToken("Token invalid or expired".to_string())
    })?;

    req.extensions_mut().insert(AuthUser::from(claims));
    Ok(next.run(req).await)
}

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Verify signature and expiration, returning the decoded claims
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<Claims>(token, &key, &Validation::default())?;
    Ok(data.claims)
}
