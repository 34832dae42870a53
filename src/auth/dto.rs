use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::{Gender, Profile};

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Request body for token refresh.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<String>,
    pub gender: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
}

/// Response returned after login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub picture_url: Option<String>,
    pub birth_date: Option<String>,
    pub gender: Option<Gender>,
    pub verified: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ProfileResponse {
    pub fn new(profile: Profile, picture_url: Option<String>) -> Self {
        Self {
            id: profile.user_id,
            email: profile.email,
            first_name: profile.first_name,
            last_name: profile.last_name,
            phone: profile.phone,
            picture_url,
            birth_date: profile.birth_date.map(|d| d.to_string()),
            gender: profile.gender,
            verified: profile.verified,
            created_at: profile.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PictureResponse {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_profile_fields_are_optional() {
        let req: RegisterRequest =
            serde_json::from_str(r#"{"email":"a@example.com","password":"Str0ng!Pass"}"#).unwrap();
        assert_eq!(req.first_name, "");
        assert_eq!(req.last_name, "");
    }

    #[test]
    fn refresh_response_omits_unrotated_token() {
        let res = RefreshResponse {
            access_token: "a".into(),
            refresh_token: None,
            token_type: "Bearer",
            expires_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&res).unwrap();
        assert!(json.get("refresh_token").is_none());
        assert_eq!(json["expires_at"], "1970-01-01T00:00:00Z");
    }
}
