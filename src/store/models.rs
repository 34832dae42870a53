use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Identity row. Soft-deleted users are never returned by lookups.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 PHC string
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            other => Err(format!("gender must be either 'male' or 'female', got '{other}'")),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile snapshot joined with the identity email. This is also the shape
/// cached under `user:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub picture: Option<String>,
    pub birth_date: Option<Date>,
    pub gender: Option<Gender>,
    pub verified: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

/// Profile fields supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct NewProfile {
    pub first_name: String,
    pub last_name: String,
}

/// Fully resolved profile values for a store write.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileFields {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<Date>,
    pub gender: Option<Gender>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub device: String,
    pub expires_at: OffsetDateTime,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoginHistory {
    pub id: i64,
    pub user_id: Uuid,
    pub login_time: OffsetDateTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device: String,
    pub logout_time: Option<OffsetDateTime>,
    pub logout_reason: Option<String>,
}

impl LoginHistory {
    pub fn is_open(&self) -> bool {
        self.logout_time.is_none()
    }
}

/// Why a login-history row was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    UserLogout,
    TokenRevoked,
    /// A newer login on the same device replaced this one.
    Superseded,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutReason::UserLogout => "user_logout",
            LogoutReason::TokenRevoked => "token_revoked",
            LogoutReason::Superseded => "superseded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gender_parses_only_known_values() {
        assert_eq!("male".parse::<Gender>(), Ok(Gender::Male));
        assert_eq!("female".parse::<Gender>(), Ok(Gender::Female));
        assert!("Male".parse::<Gender>().is_err());
        assert!("other".parse::<Gender>().is_err());
    }

    #[test]
    fn profile_survives_json_cache_roundtrip() {
        let profile = Profile {
            user_id: Uuid::new_v4(),
            email: "alice@example.com".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
            phone: String::new(),
            picture: None,
            birth_date: Some(time::macros::date!(1990 - 04 - 01)),
            gender: Some(Gender::Female),
            verified: false,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
        };
        let raw = serde_json::to_string(&profile).unwrap();
        assert!(raw.contains("\"gender\":\"female\""));
        let back: Profile = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, profile);
    }
}
