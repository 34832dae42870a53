use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, ChangePasswordRequest, LoginRequest, MessageResponse, PictureResponse,
            ProfileResponse, PublicUser, RefreshRequest, RefreshResponse, RegisterRequest,
            UpdateProfileRequest,
        },
        extractors::{AuthUser, ClientInfo},
        session::{ClientContext, PictureUpload, ProfileUpdate, Registration, MAX_PICTURE_BYTES},
    },
    error::AuthError,
    state::AppState,
    store::Profile,
};

const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::ValidationFailed("Invalid email".into()));
    }
    Ok(email)
}

fn check_password_len(password: &str) -> Result<(), AuthError> {
    if password.len() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(AuthError::ValidationFailed("Password too short".into()));
    }
    Ok(())
}

impl From<ClientInfo> for ClientContext {
    fn from(info: ClientInfo) -> Self {
        Self {
            user_agent: info.user_agent,
            ip_address: info.ip_address,
        }
    }
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/revoke/:handle", get(revoke_all))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_me))
        .route("/auth/profile", put(update_profile))
        .route(
            "/auth/profile/picture",
            put(update_picture).layer(DefaultBodyLimit::max(MAX_PICTURE_BYTES + 1024 * 1024)),
        )
        .route("/auth/password", put(change_password))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    let email = normalize_email(&payload.email)?;
    check_password_len(&payload.password)?;

    let id = state
        .sessions
        .register(Registration {
            email: email.clone(),
            password: payload.password,
            first_name: payload.first_name.trim().to_string(),
            last_name: payload.last_name.trim().to_string(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(PublicUser { id, email })))
}

#[instrument(skip(state, payload, client))]
pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let email = normalize_email(&payload.email)?;

    let out = state
        .sessions
        .login(&email, &payload.password, &client.into())
        .await?;

    Ok(Json(AuthResponse {
        access_token: out.access.token,
        refresh_token: out.refresh.token,
        token_type: "Bearer",
        expires_at: out.access.expires_at,
        user: PublicUser {
            id: out.user.id,
            email: out.user.email,
        },
    }))
}

#[instrument(skip(state, payload, client))]
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AuthError> {
    let out = state
        .sessions
        .refresh(payload.refresh_token.trim(), &client.into())
        .await?;

    Ok(Json(RefreshResponse {
        access_token: out.access.token,
        refresh_token: out.refresh.map(|t| t.token),
        token_type: "Bearer",
        expires_at: out.access.expires_at,
    }))
}

#[instrument(skip(state, user, client), fields(user_id = %user.user_id))]
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    client: ClientInfo,
) -> Result<StatusCode, AuthError> {
    state
        .sessions
        .logout(user.user_id, &user.email, &client.user_agent)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all)]
pub async fn revoke_all(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.sessions.revoke_all_sessions(&handle).await?;
    Ok(Json(MessageResponse {
        message: "All sessions have been signed out",
    }))
}

async fn profile_response(state: &AppState, profile: Profile) -> Result<ProfileResponse, AuthError> {
    let picture_url = match profile.picture.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => Some(state.sessions.picture_url(key).await?),
        None => None,
    };
    Ok(ProfileResponse::new(profile, picture_url))
}

#[instrument(skip(state, user), fields(user_id = %user.user_id))]
pub async fn get_me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ProfileResponse>, AuthError> {
    let profile = state.sessions.profile(user.user_id).await?;
    Ok(Json(profile_response(&state, profile).await?))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.user_id))]
pub async fn update_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileResponse>, AuthError> {
    let profile = state
        .sessions
        .update_profile(
            user.user_id,
            ProfileUpdate {
                first_name: payload.first_name,
                last_name: payload.last_name,
                birth_date: payload.birth_date,
                gender: payload.gender,
            },
        )
        .await?;
    Ok(Json(profile_response(&state, profile).await?))
}

/// PUT /auth/profile/picture (multipart field `picture`)
#[instrument(skip(state, user, mp), fields(user_id = %user.user_id))]
pub async fn update_picture(
    State(state): State<AppState>,
    user: AuthUser,
    mut mp: Multipart,
) -> Result<Json<PictureResponse>, AuthError> {
    let bad_upload = |e: axum::extract::multipart::MultipartError| {
        warn!(error = %e, "unreadable multipart body");
        AuthError::ValidationFailed("Invalid multipart body".into())
    };

    let mut upload = None;
    while let Some(field) = mp.next_field().await.map_err(bad_upload)? {
        if field.name() != Some("picture") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let body = field.bytes().await.map_err(bad_upload)?;
        upload = Some(PictureUpload { file_name, body });
        break;
    }
    let upload = upload.ok_or_else(|| {
        AuthError::ValidationFailed("Missing multipart field 'picture'".into())
    })?;

    let key = state.sessions.update_picture(user.user_id, upload).await?;
    let url = state.sessions.picture_url(&key).await?;
    Ok(Json(PictureResponse { key, url }))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.user_id))]
pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AuthError> {
    check_password_len(&payload.new_password)?;
    state
        .sessions
        .change_password(user.user_id, &payload.current_password, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
