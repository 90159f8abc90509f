//! Account endpoints: registration, login, logout, password reset, and
//! account deletion.

use crate::auth::require_auth;
use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;
use wharf_core::password::{hash_password, verify_password};
use wharf_core::reference::validate_username;
use wharf_core::{ACCESS_TOKEN_TTL_SECS, REFRESH_TOKEN_TTL_SECS};
use wharf_metadata::MetadataError;
use wharf_metadata::models::{SessionRow, UserRow};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SigninRequest {
    /// Username or email.
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SigninResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn bad_request(code: ErrorCode, message: impl Into<String>) -> RegistryError {
    RegistryError::new(StatusCode::BAD_REQUEST, code, message)
}

/// POST /auth/signup
#[tracing::instrument(skip(state, body), fields(username = %body.username))]
pub async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    validate_username(&body.username)
        .map_err(|err| bad_request(ErrorCode::NameInvalid, err.to_string()))?;
    if !body.email.contains('@') {
        return Err(bad_request(ErrorCode::Unsupported, "invalid email address"));
    }
    if body.password.len() < MIN_PASSWORD_LEN {
        return Err(bad_request(
            ErrorCode::Unsupported,
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }

    let password_hash = hash_password(&body.password)?;
    let now = OffsetDateTime::now_utc();
    let user = UserRow {
        id: Uuid::new_v4(),
        is_active: true,
        username: body.username.clone(),
        email: body.email,
        name: None,
        password_hash: Some(password_hash),
        html_url: None,
        oauth_id: None,
        created_at: now,
        updated_at: now,
    };

    state.metadata.add_user(&user).await.map_err(|err| match err {
        MetadataError::Conflict(_) => RegistryError::new(
            StatusCode::CONFLICT,
            ErrorCode::Unknown,
            "username or email is already taken",
        ),
        other => other.into(),
    })?;

    tracing::info!(user_id = %user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "signup successful".to_string(),
        }),
    ))
}

/// POST /auth/signin
#[tracing::instrument(skip(state, body))]
pub async fn signin(
    State(state): State<AppState>,
    Json(body): Json<SigninRequest>,
) -> ApiResult<Json<SigninResponse>> {
    // A missing user and a wrong password answer identically.
    let invalid = || RegistryError::unauthorized("invalid credentials");

    let user = state
        .metadata
        .get_user(&body.identifier)
        .await
        .map_err(|_| invalid())?;

    if !user.is_active {
        return Err(invalid());
    }
    let Some(hash) = user.password_hash.as_deref() else {
        return Err(invalid());
    };
    if !verify_password(&body.password, hash) {
        return Err(invalid());
    }

    let session_id = Uuid::new_v4();
    let refresh_token = state
        .signer
        .issue(&user.username, session_id, REFRESH_TOKEN_TTL_SECS)?;
    let access_token = state
        .signer
        .issue(&user.username, session_id, ACCESS_TOKEN_TTL_SECS)?;

    state
        .metadata
        .add_session(&SessionRow {
            id: session_id,
            refresh_token: refresh_token.clone(),
            owner: user.id,
        })
        .await?;

    tracing::info!(user_id = %user.id, session_id = %session_id, "user signed in");
    Ok(Json(SigninResponse {
        access_token,
        refresh_token,
        expires_in: ACCESS_TOKEN_TTL_SECS,
    }))
}

/// POST /auth/signout[?all=true]
pub async fn signout(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> ApiResult<Json<MessageResponse>> {
    let auth = require_auth(&req)?.clone();

    let all = params.get("all").map(String::as_str) == Some("true");
    if all {
        state.metadata.delete_all_sessions(auth.user_id).await?;
    } else {
        state
            .metadata
            .delete_session(auth.claims.jti, auth.user_id)
            .await?;
    }

    tracing::info!(user_id = %auth.user_id, all, "user signed out");
    Ok(Json(MessageResponse {
        message: "signout successful".to_string(),
    }))
}

/// POST /auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<MessageResponse>> {
    let auth = require_auth(&req)?.clone();

    let bytes = crate::handlers::common::read_body(req.into_body(), 64 * 1024).await?;
    let body: ResetPasswordRequest = serde_json::from_slice(&bytes)
        .map_err(|err| bad_request(ErrorCode::Unsupported, format!("invalid JSON: {err}")))?;

    if body.new_password.len() < MIN_PASSWORD_LEN {
        return Err(bad_request(
            ErrorCode::Unsupported,
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }

    let user = state.metadata.get_user_by_id(auth.user_id).await?;
    let Some(hash) = user.password_hash.as_deref() else {
        return Err(RegistryError::unauthorized(
            "account has no password set",
        ));
    };
    if !verify_password(&body.old_password, hash) {
        return Err(RegistryError::unauthorized("invalid credentials"));
    }

    let new_hash = hash_password(&body.new_password)?;
    state.metadata.update_password(user.id, &new_hash).await?;

    tracing::info!(user_id = %user.id, "password updated");
    Ok(Json(MessageResponse {
        message: "password updated".to_string(),
    }))
}

/// DELETE /auth/user - delete the authenticated account.
pub async fn delete_user(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let auth = require_auth(&req)?;

    state.metadata.delete_user(&auth.claims.sub).await?;

    tracing::info!(user_id = %auth.user_id, username = %auth.claims.sub, "user deleted");
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "account deleted".to_string(),
        }),
    ))
}
