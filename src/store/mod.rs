//! Durable credential store: users, profiles, refresh-token records and
//! login history. Pure data access, no business rules.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

mod memory;
pub mod models;
mod postgres;

pub use memory::MemoryStore;
pub use models::{
    Gender, LoginHistory, LogoutReason, NewProfile, Profile, ProfileFields, RefreshTokenRecord,
    User,
};
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    Duplicate,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A login being recorded in the history table.
#[derive(Debug, Clone)]
pub struct NewLogin<'a> {
    pub user_id: Uuid,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub device: &'a str,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert the identity row and its profile row in one transaction.
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        profile: &NewProfile,
    ) -> Result<Uuid, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError>;

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<(), StoreError>;

    async fn get_profile(&self, user_id: Uuid) -> Result<Profile, StoreError>;

    async fn update_profile(&self, user_id: Uuid, fields: &ProfileFields)
        -> Result<(), StoreError>;

    async fn update_picture(&self, user_id: Uuid, picture: &str) -> Result<(), StoreError>;

    /// Deactivate any active record for `(user_id, device)` and insert the new
    /// one as the single active record, atomically.
    async fn create_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    async fn get_active_refresh_token(
        &self,
        user_id: Uuid,
        device: &str,
    ) -> Result<RefreshTokenRecord, StoreError>;

    async fn list_active_refresh_tokens(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RefreshTokenRecord>, StoreError>;

    async fn deactivate_refresh_token(&self, user_id: Uuid, device: &str)
        -> Result<u64, StoreError>;

    async fn deactivate_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Close any open row for the same (user, device) as superseded and insert
    /// the new one, atomically. Returns the new row's id.
    async fn open_login(&self, login: NewLogin<'_>) -> Result<i64, StoreError>;

    /// Close open history rows for one device. Returns the number closed.
    async fn close_login(
        &self,
        user_id: Uuid,
        device: &str,
        reason: LogoutReason,
    ) -> Result<u64, StoreError>;

    async fn close_all_logins(&self, user_id: Uuid, reason: LogoutReason)
        -> Result<u64, StoreError>;

    /// Full history for a user, oldest first.
    async fn login_history(&self, user_id: Uuid) -> Result<Vec<LoginHistory>, StoreError>;
}
