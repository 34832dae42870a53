use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CredentialStore, LoginHistory, LogoutReason, NewLogin, NewProfile, Profile, ProfileFields,
    RefreshTokenRecord, StoreError, User,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    profiles: HashMap<Uuid, Profile>,
    refresh_tokens: Vec<RefreshTokenRecord>,
    history: Vec<LoginHistory>,
    next_history_id: i64,
}

/// In-process [`CredentialStore`] for tests and local runs without Postgres.
/// A single lock guards every table, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        profile: &NewProfile,
    ) -> Result<Uuid, StoreError> {
        let mut t = self.tables.lock().await;
        if t.users.values().any(|u| u.email == email) {
            return Err(StoreError::Duplicate);
        }
        let now = OffsetDateTime::now_utc();
        let id = Uuid::new_v4();
        t.users.insert(
            id,
            User {
                id,
                email: email.to_string(),
                password_hash: password_hash.to_string(),
                created_at: now,
            },
        );
        t.profiles.insert(
            id,
            Profile {
                user_id: id,
                email: email.to_string(),
                first_name: profile.first_name.clone(),
                last_name: profile.last_name.clone(),
                phone: String::new(),
                picture: None,
                birth_date: None,
                gender: None,
                verified: false,
                created_at: now,
                updated_at: None,
            },
        );
        Ok(id)
    }

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
        let t = self.tables.lock().await;
        t.users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        let t = self.tables.lock().await;
        t.users.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let user = t.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Profile, StoreError> {
        let t = self.tables.lock().await;
        t.profiles.get(&user_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileFields,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let p = t.profiles.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        p.first_name = fields.first_name.clone();
        p.last_name = fields.last_name.clone();
        p.birth_date = fields.birth_date;
        p.gender = fields.gender;
        p.updated_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn update_picture(&self, user_id: Uuid, picture: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let p = t.profiles.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        p.picture = Some(picture.to_string());
        p.updated_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn create_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        if !t.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }
        for r in t
            .refresh_tokens
            .iter_mut()
            .filter(|r| r.user_id == user_id && r.device == device)
        {
            r.is_active = false;
        }
        t.refresh_tokens.push(RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id,
            token_hash: token_hash.to_string(),
            device: device.to_string(),
            expires_at,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn get_active_refresh_token(
        &self,
        user_id: Uuid,
        device: &str,
    ) -> Result<RefreshTokenRecord, StoreError> {
        let t = self.tables.lock().await;
        t.refresh_tokens
            .iter()
            .find(|r| r.user_id == user_id && r.device == device && r.is_active)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_active_refresh_tokens(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.refresh_tokens
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn deactivate_refresh_token(
        &self,
        user_id: Uuid,
        device: &str,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().await;
        let mut n = 0;
        for r in t
            .refresh_tokens
            .iter_mut()
            .filter(|r| r.user_id == user_id && r.device == device && r.is_active)
        {
            r.is_active = false;
            n += 1;
        }
        Ok(n)
    }

    async fn deactivate_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().await;
        let mut n = 0;
        for r in t
            .refresh_tokens
            .iter_mut()
            .filter(|r| r.user_id == user_id && r.is_active)
        {
            r.is_active = false;
            n += 1;
        }
        Ok(n)
    }

    async fn open_login(&self, login: NewLogin<'_>) -> Result<i64, StoreError> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        for h in t
            .history
            .iter_mut()
            .filter(|h| h.user_id == login.user_id && h.device == login.device && h.is_open())
        {
            h.logout_time = Some(now);
            h.logout_reason = Some(LogoutReason::Superseded.as_str().to_string());
        }
        t.next_history_id += 1;
        let id = t.next_history_id;
        t.history.push(LoginHistory {
            id,
            user_id: login.user_id,
            login_time: now,
            ip_address: login.ip_address.map(str::to_string),
            user_agent: login.user_agent.map(str::to_string),
            device: login.device.to_string(),
            logout_time: None,
            logout_reason: None,
        });
        Ok(id)
    }

    async fn close_login(
        &self,
        user_id: Uuid,
        device: &str,
        reason: LogoutReason,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut n = 0;
        for h in t
            .history
            .iter_mut()
            .filter(|h| h.user_id == user_id && h.device == device && h.is_open())
        {
            h.logout_time = Some(now);
            h.logout_reason = Some(reason.as_str().to_string());
            n += 1;
        }
        Ok(n)
    }

    async fn close_all_logins(
        &self,
        user_id: Uuid,
        reason: LogoutReason,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut n = 0;
        for h in t
            .history
            .iter_mut()
            .filter(|h| h.user_id == user_id && h.is_open())
        {
            h.logout_time = Some(now);
            h.logout_reason = Some(reason.as_str().to_string());
            n += 1;
        }
        Ok(n)
    }

    async fn login_history(&self, user_id: Uuid) -> Result<Vec<LoginHistory>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.history
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect())
    }
}
