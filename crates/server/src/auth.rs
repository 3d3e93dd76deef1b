use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

/// Claims issued by the external account subsystem. Only the subject (user id)
/// and email are consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: String,
}

pub fn verify_token(secret: &str, token: &str) -> Result<AuthUser, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::new(ErrorCode::Unauthorized, "invalid bearer token"))?;
    Ok(AuthUser {
        user_id: UserId(data.claims.sub),
        email: data.claims.email,
    })
}

/// Resolves the caller from the `Authorization: Bearer` header. A missing or
/// invalid token rejects before any core component is touched.
pub fn bearer_user(secret: &str, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match token {
        Some(token) => verify_token(secret, token),
        None => Err(ApiError::new(
            ErrorCode::Unauthorized,
            "missing bearer token",
        )),
    }
}

/// Token issuance belongs to the external account subsystem; this exists only
/// so tests can forge the credentials it would have handed out.
#[cfg(test)]
pub fn mint_token(
    secret: &str,
    user_id: &UserId,
    email: &str,
    ttl_seconds: i64,
) -> anyhow::Result<String> {
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user_id.0.clone(),
        email: email.to_string(),
        exp: Utc::now().timestamp() + ttl_seconds,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}
