use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;
use uuid::Uuid;

use snackngo_core::OrderEngine;
use snackngo_types::api::{
    AdminTokenRequest, Claims, RegisterRequest, RegisterResponse, TokenResponse,
};

use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: OrderEngine,
    pub jwt_secret: String,
    /// Key that mints operator tokens. Without one, no operator can log in.
    pub admin_key: Option<String>,
}

/// First interaction: create the user and hand back a token.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let username = req.username.trim();
    if username.len() < 3 || username.len() > 32 {
        return Err(ApiError::BadRequest(
            "username must be 3 to 32 characters".into(),
        ));
    }
    let email = req.email.trim();
    if !email.contains('@') {
        return Err(ApiError::BadRequest("email is not valid".into()));
    }

    let user = state.engine.register_user(username, email).await?;
    let token = create_token(&state.jwt_secret, user.id, &user.username, false)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: user.to_response(),
            token,
        }),
    ))
}

/// Mint an operator token in exchange for the admin key.
pub async fn admin_token(
    State(state): State<AppState>,
    Json(req): Json<AdminTokenRequest>,
) -> ApiResult<Json<TokenResponse>> {
    match &state.admin_key {
        Some(key) if !key.is_empty() && *key == req.key => {}
        _ => return Err(ApiError::Unauthorized),
    }

    let token = create_token(&state.jwt_secret, Uuid::nil(), "operator", true)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!("operator token issued");
    Ok(Json(TokenResponse { token }))
}

pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    admin: bool,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        admin,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
