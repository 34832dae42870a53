//! Session lifecycle: register, login, refresh, logout, forced revocation and
//! profile maintenance.
//!
//! The credential store is authoritative. The session cache only accelerates
//! reads, so every cache write here is best effort and every cache read has a
//! store fallback, except the revocation marker which lives only in the cache.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use time::{macros::format_description, Date, OffsetDateTime};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        device::normalize_device,
        jwt::{hash_refresh_token, Claims, IssuedToken, TokenCodec},
        password::{hash_password_async, verify_password_async},
        rate_limit::RateLimiter,
        revocation::RevocationCodec,
    },
    cache::{keys, SessionCache},
    config::{AppConfig, SessionConfig},
    error::AuthError,
    notify::{EventKind, LifecycleEvent, Publisher},
    storage::ObjectStorage,
    store::{
        CredentialStore, Gender, LoginHistory, LogoutReason, NewLogin, NewProfile, Profile,
        ProfileFields, StoreError, User,
    },
};

pub const MAX_PICTURE_BYTES: usize = 10 * 1024 * 1024;
const PICTURE_URL_TTL: Duration = Duration::from_secs(60 * 60);

/// Tunables of the lifecycle manager.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub login_limit: u64,
    pub login_window: Duration,
    pub profile_ttl: Duration,
    pub revoke_link_ttl: Duration,
    pub rotate_refresh_on_use: bool,
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            login_limit: cfg.login_rate_limit,
            login_window: cfg.login_window(),
            profile_ttl: cfg.profile_ttl(),
            revoke_link_ttl: cfg.revoke_link_ttl(),
            rotate_refresh_on_use: cfg.rotate_refresh_on_use,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// Where a login or refresh comes from.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub user_agent: String,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub device: String,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access: IssuedToken,
    /// Present only when refresh tokens rotate on use.
    pub refresh: Option<IssuedToken>,
}

/// Requested profile changes. `None` or empty strings keep the current value.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<String>,
    pub gender: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PictureUpload {
    pub file_name: String,
    pub body: Bytes,
}

/// Everything the manager talks to, handed over at construction.
pub struct Collaborators {
    pub store: Arc<dyn CredentialStore>,
    pub cache: Arc<dyn SessionCache>,
    pub publisher: Arc<dyn Publisher>,
    pub storage: Arc<dyn ObjectStorage>,
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    cache: Arc<dyn SessionCache>,
    publisher: Arc<dyn Publisher>,
    storage: Arc<dyn ObjectStorage>,
    tokens: TokenCodec,
    limiter: RateLimiter,
    revocation: RevocationCodec,
    policy: SessionPolicy,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_birth_date(raw: &str) -> Result<Date, AuthError> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|_| AuthError::ValidationFailed("birth_date must be in YYYY-MM-DD format".into()))
}

fn picture_extension(file_name: &str) -> Result<(&'static str, &'static str), AuthError> {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Ok(("png", "image/png")),
        "jpg" => Ok(("jpg", "image/jpeg")),
        "jpeg" => Ok(("jpeg", "image/jpeg")),
        _ => Err(AuthError::ValidationFailed(
            "picture must be a png, jpg or jpeg file".into(),
        )),
    }
}

impl SessionManager {
    pub fn new(config: &AppConfig, deps: Collaborators) -> Self {
        let policy = SessionPolicy::from(&config.session);
        let limiter = RateLimiter::new(deps.cache.clone(), policy.login_limit, policy.login_window);
        Self {
            store: deps.store,
            cache: deps.cache,
            publisher: deps.publisher,
            storage: deps.storage,
            tokens: TokenCodec::new(&config.jwt),
            limiter,
            revocation: RevocationCodec::new(&config.session.revoke_link_secret),
            policy,
        }
    }

    pub fn tokens(&self) -> &TokenCodec {
        &self.tokens
    }

    async fn emit(&self, event: LifecycleEvent) {
        let kind = event.kind;
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, kind = ?kind, "lifecycle event dropped");
        }
    }

    async fn cache_set_quietly(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.cache.set(key, value, ttl).await {
            warn!(error = %e, key, "cache write failed");
        }
    }

    async fn cache_delete_quietly(&self, key: &str) {
        if let Err(e) = self.cache.delete(key).await {
            warn!(error = %e, key, "cache delete failed");
        }
    }

    #[instrument(skip_all, fields(email = %reg.email))]
    pub async fn register(&self, reg: Registration) -> Result<Uuid, AuthError> {
        match self.store.find_by_email(&reg.email).await {
            Ok(_) => {
                warn!("email already registered");
                return Err(AuthError::DuplicateIdentity);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let hash = hash_password_async(reg.password).await?;
        let profile = NewProfile {
            first_name: reg.first_name,
            last_name: reg.last_name,
        };
        // A concurrent registration surfaces here as Duplicate.
        let user_id = self.store.create_user(&reg.email, &hash, &profile).await?;

        info!(user_id = %user_id, "user registered");
        self.emit(LifecycleEvent::new(EventKind::Register, user_id, &reg.email))
            .await;
        Ok(user_id)
    }

    async fn persist_refresh(
        &self,
        user_id: Uuid,
        email: &str,
        device: &str,
        refresh: &IssuedToken,
    ) -> Result<(), AuthError> {
        let hash = hash_refresh_token(&refresh.token);
        self.store
            .create_refresh_token(user_id, &hash, device, refresh.expires_at)
            .await?;
        self.cache_set_quietly(
            &keys::refresh_token(email, device),
            &hash,
            self.tokens.refresh_ttl(),
        )
        .await;
        Ok(())
    }

    #[instrument(skip_all, fields(email = %email))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: &ClientContext,
    ) -> Result<LoginOutcome, AuthError> {
        if !self.limiter.allow(email).await? {
            warn!("login rate limited");
            return Err(AuthError::RateLimited);
        }

        let user = match self.store.find_by_email(email).await {
            Ok(u) => u,
            Err(StoreError::NotFound) => {
                warn!("login unknown email");
                return Err(AuthError::InvalidCredential);
            }
            Err(e) => return Err(e.into()),
        };

        if !verify_password_async(password.to_string(), user.password_hash.clone()).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredential);
        }

        let access = self.tokens.issue_access(user.id, &user.email)?;
        let refresh = self.tokens.issue_refresh(user.id, &user.email)?;
        let device = normalize_device(&client.user_agent);

        self.persist_refresh(user.id, &user.email, &device, &refresh)
            .await?;
        let login_id = self
            .store
            .open_login(NewLogin {
                user_id: user.id,
                ip_address: client.ip_address.as_deref(),
                user_agent: Some(client.user_agent.as_str()),
                device: &device,
            })
            .await?;

        info!(user_id = %user.id, device = %device, "user logged in");
        let mut event = LifecycleEvent::new(EventKind::Login, user.id, &user.email);
        event.metadata.ip_address = client.ip_address.clone();
        event.metadata.device = Some(device.clone());
        event.metadata.user_agent = Some(client.user_agent.clone());
        event.metadata.login_id = Some(login_id);
        self.emit(event).await;

        Ok(LoginOutcome {
            user,
            device,
            access,
            refresh,
        })
    }

    /// Authoritative check of a presented refresh hash against the store.
    async fn check_refresh_in_store(
        &self,
        claims: &Claims,
        hash: &str,
        device: &str,
        cache_key: &str,
    ) -> Result<(), AuthError> {
        let record = match self.store.get_active_refresh_token(claims.sub, device).await {
            Ok(r) => r,
            Err(StoreError::NotFound) => {
                let others = self.store.list_active_refresh_tokens(claims.sub).await?;
                if others.iter().any(|r| r.token_hash == hash) {
                    warn!(user_id = %claims.sub, device, "refresh token presented from another device");
                    return Err(AuthError::TokenMismatch);
                }
                return Err(AuthError::SessionNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        if record.token_hash != hash {
            return Err(AuthError::TokenMismatch);
        }
        let remaining = record.expires_at - OffsetDateTime::now_utc();
        if !remaining.is_positive() {
            return Err(AuthError::TokenExpired);
        }

        let ttl = Duration::from_secs(remaining.whole_seconds().max(1) as u64);
        self.cache_set_quietly(cache_key, hash, ttl).await;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        presented: &str,
        client: &ClientContext,
    ) -> Result<RefreshOutcome, AuthError> {
        let claims = self.tokens.verify_refresh(presented)?;
        let hash = hash_refresh_token(presented);
        let device = normalize_device(&client.user_agent);
        let cache_key = keys::refresh_token(&claims.email, &device);

        match self.cache.get(&cache_key).await {
            Ok(Some(cached)) if cached == hash => {
                debug!(user_id = %claims.sub, "refresh token matched cache");
            }
            Ok(Some(_)) => {
                warn!(user_id = %claims.sub, device = %device, "refresh token does not match cache");
                return Err(AuthError::TokenMismatch);
            }
            Ok(None) => {
                self.check_refresh_in_store(&claims, &hash, &device, &cache_key)
                    .await?
            }
            Err(e) => {
                warn!(error = %e, "cache read failed, falling back to store");
                self.check_refresh_in_store(&claims, &hash, &device, &cache_key)
                    .await?
            }
        }

        let access = self.tokens.issue_access(claims.sub, &claims.email)?;
        let refresh = if self.policy.rotate_refresh_on_use {
            let next = self.tokens.issue_refresh(claims.sub, &claims.email)?;
            self.persist_refresh(claims.sub, &claims.email, &device, &next)
                .await?;
            Some(next)
        } else {
            None
        };

        info!(user_id = %claims.sub, device = %device, rotated = refresh.is_some(), "token refreshed");
        Ok(RefreshOutcome { access, refresh })
    }

    /// Verify a bearer access token.
    pub fn authenticate(&self, access_token: &str) -> Result<Claims, AuthError> {
        Ok(self.tokens.verify_access(access_token)?)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn logout(
        &self,
        user_id: Uuid,
        email: &str,
        user_agent: &str,
    ) -> Result<(), AuthError> {
        let device = normalize_device(user_agent);
        let closed = self
            .store
            .close_login(user_id, &device, LogoutReason::UserLogout)
            .await?;
        let deactivated = self.store.deactivate_refresh_token(user_id, &device).await?;
        self.cache_delete_quietly(&keys::refresh_token(email, &device))
            .await;

        info!(device = %device, closed, deactivated, "user logged out");
        Ok(())
    }

    /// Seal `email` into a revocation handle and arm its marker.
    #[instrument(skip_all, fields(email = %email))]
    pub async fn issue_revocation_link(&self, email: &str) -> Result<String, AuthError> {
        let handle = self.revocation.seal(email)?;
        self.cache
            .set(&keys::revocation(email), &handle, self.policy.revoke_link_ttl)
            .await?;
        debug!("revocation link issued");
        Ok(handle)
    }

    #[instrument(skip_all)]
    pub async fn revoke_all_sessions(&self, handle: &str) -> Result<(), AuthError> {
        let email = self.revocation.open(handle)?;
        let marker_key = keys::revocation(&email);

        let marker = self.cache.get(&marker_key).await?;
        if marker.as_deref() != Some(handle) {
            warn!(email = %email, "revocation link expired or superseded");
            return Err(AuthError::ExpiredRevocationLink);
        }

        let user = self.store.find_by_email(&email).await?;
        let closed = self
            .store
            .close_all_logins(user.id, LogoutReason::TokenRevoked)
            .await?;
        let deactivated = self.store.deactivate_all_refresh_tokens(user.id).await?;

        if let Err(e) = self
            .cache
            .delete_prefix(&keys::refresh_token_prefix(&email))
            .await
        {
            warn!(error = %e, "failed to purge cached refresh tokens");
        }
        self.cache_delete_quietly(&marker_key).await;

        info!(user_id = %user.id, closed, deactivated, "all sessions revoked");
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn profile(&self, user_id: Uuid) -> Result<Profile, AuthError> {
        let key = keys::profile(user_id);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Profile>(&raw) {
                Ok(p) => return Ok(p),
                Err(e) => warn!(error = %e, "cached profile is unreadable"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cache read failed, falling back to store"),
        }

        let profile = self.store.get_profile(user_id).await?;
        match serde_json::to_string(&profile) {
            Ok(raw) => {
                self.cache_set_quietly(&key, &raw, self.policy.profile_ttl)
                    .await
            }
            Err(e) => warn!(error = %e, "failed to encode profile for cache"),
        }
        Ok(profile)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Profile, AuthError> {
        let current = self.profile(user_id).await?;

        let birth_date = match non_empty(update.birth_date) {
            Some(raw) => Some(parse_birth_date(&raw)?),
            None => current.birth_date,
        };
        let gender = match non_empty(update.gender) {
            Some(raw) => Some(raw.parse::<Gender>().map_err(AuthError::ValidationFailed)?),
            None => current.gender,
        };
        let fields = ProfileFields {
            first_name: non_empty(update.first_name).unwrap_or(current.first_name.clone()),
            last_name: non_empty(update.last_name).unwrap_or(current.last_name.clone()),
            birth_date,
            gender,
        };

        self.store.update_profile(user_id, &fields).await?;
        self.cache_delete_quietly(&keys::profile(user_id)).await;
        info!("profile updated");

        Ok(Profile {
            first_name: fields.first_name,
            last_name: fields.last_name,
            birth_date: fields.birth_date,
            gender: fields.gender,
            updated_at: Some(OffsetDateTime::now_utc()),
            ..current
        })
    }

    /// Replace the profile picture. Returns the new object key.
    #[instrument(skip_all, fields(user_id = %user_id, file_name = %upload.file_name))]
    pub async fn update_picture(
        &self,
        user_id: Uuid,
        upload: PictureUpload,
    ) -> Result<String, AuthError> {
        let current = self.profile(user_id).await?;

        let (ext, content_type) = picture_extension(&upload.file_name)?;
        if upload.body.len() > MAX_PICTURE_BYTES {
            return Err(AuthError::ValidationFailed(
                "picture must not exceed 10 MiB".into(),
            ));
        }

        let key = format!("profiles/{user_id}/{}.{ext}", Uuid::new_v4());
        self.storage
            .put_object(&key, upload.body, content_type)
            .await
            .context("upload profile picture")?;
        if let Err(e) = self.store.update_picture(user_id, &key).await {
            // nothing references the new object, drop it
            if let Err(cleanup) = self.storage.delete_object(&key).await {
                warn!(error = %cleanup, key = %key, "failed to delete orphaned picture");
            }
            return Err(e.into());
        }

        if let Some(old) = current.picture.as_deref().filter(|k| !k.is_empty()) {
            if let Err(e) = self.storage.delete_object(old).await {
                warn!(error = %e, key = old, "failed to delete previous picture");
            }
        }
        self.cache_delete_quietly(&keys::profile(user_id)).await;

        info!(key = %key, "profile picture updated");
        Ok(key)
    }

    pub async fn picture_url(&self, key: &str) -> Result<String, AuthError> {
        Ok(self
            .storage
            .presign_get(key, PICTURE_URL_TTL)
            .await
            .context("presign profile picture")?)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self.store.find_by_id(user_id).await?;
        if !verify_password_async(current_password.to_string(), user.password_hash.clone()).await? {
            warn!("change password with wrong current password");
            return Err(AuthError::InvalidCredential);
        }

        let hash = hash_password_async(new_password.to_string()).await?;
        self.store.update_password(user_id, &hash).await?;

        info!("password changed");
        self.emit(LifecycleEvent::new(
            EventKind::PasswordChanged,
            user_id,
            &user.email,
        ))
        .await;
        Ok(())
    }

    pub async fn login_history(&self, user_id: Uuid) -> Result<Vec<LoginHistory>, AuthError> {
        Ok(self.store.login_history(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::jwt::TokenKind,
        cache::{CacheError, MemoryCache},
        notify::PublishError,
        storage::MemoryStorage,
        store::MemoryStore,
    };
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    const CHROME_WINDOWS: &str = "chrome_windows";
    const FIREFOX_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<LifecycleEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Closed);
            }
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    /// Cache whose reads and writes fail but whose counter works, so logins
    /// are not blocked by the rate limiter.
    #[derive(Default)]
    struct FlakyCache {
        counters: MemoryCache,
    }

    #[async_trait]
    impl SessionCache for FlakyCache {
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn delete_prefix(&self, _: &str) -> Result<u64, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
            self.counters.increment_with_expiry(key, window).await
        }
    }

    struct Harness {
        manager: SessionManager,
        store: Arc<MemoryStore>,
        cache: Arc<dyn SessionCache>,
        publisher: Arc<RecordingPublisher>,
        storage: Arc<MemoryStorage>,
    }

    fn harness_with(config: AppConfig, cache: Arc<dyn SessionCache>, publisher: RecordingPublisher) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(publisher);
        let storage = Arc::new(MemoryStorage::new());
        let manager = SessionManager::new(
            &config,
            Collaborators {
                store: store.clone(),
                cache: cache.clone(),
                publisher: publisher.clone(),
                storage: storage.clone(),
            },
        );
        Harness {
            manager,
            store,
            cache,
            publisher,
            storage,
        }
    }

    fn harness() -> Harness {
        harness_with(
            AppConfig::for_tests(),
            Arc::new(MemoryCache::new()),
            RecordingPublisher::default(),
        )
    }

    fn client(user_agent: &str) -> ClientContext {
        ClientContext {
            user_agent: user_agent.into(),
            ip_address: Some("203.0.113.7".into()),
        }
    }

    fn alice() -> Registration {
        Registration {
            email: "alice@example.com".into(),
            password: "Str0ng!Pass".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
        }
    }

    async fn registered() -> (Harness, Uuid) {
        let h = harness();
        let id = h.manager.register(alice()).await.unwrap();
        (h, id)
    }

    #[tokio::test]
    async fn register_hashes_password_and_emits_event() {
        let (h, id) = registered().await;
        let user = h.store.find_by_email("alice@example.com").await.unwrap();
        assert_eq!(user.id, id);
        assert_ne!(user.password_hash, "Str0ng!Pass");
        assert!(user.password_hash.starts_with("$argon2"));

        let events = h.publisher.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Register);
        assert_eq!(events[0].user_id, id);
    }

    #[tokio::test]
    async fn register_twice_is_duplicate() {
        let (h, id) = registered().await;
        let before = h.store.find_by_email("alice@example.com").await.unwrap();

        let err = h
            .manager
            .register(Registration {
                password: "An0ther!Pass".into(),
                ..alice()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicateIdentity));

        let after = h.store.find_by_email("alice@example.com").await.unwrap();
        assert_eq!(after.id, id);
        assert_eq!(after.password_hash, before.password_hash);
        h.manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_survives_publisher_failure() {
        let h = harness_with(
            AppConfig::for_tests(),
            Arc::new(MemoryCache::new()),
            RecordingPublisher {
                fail: true,
                ..Default::default()
            },
        );
        let id = h.manager.register(alice()).await.unwrap();
        assert_eq!(h.store.find_by_id(id).await.unwrap().email, "alice@example.com");
    }

    #[tokio::test]
    async fn login_then_refresh_same_device_then_mismatch_elsewhere() {
        let (h, id) = registered().await;
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        assert_eq!(login.device, "windows_chrome");
        assert_eq!(h.manager.authenticate(&login.access.token).unwrap().sub, id);

        let refreshed = h
            .manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap();
        assert_eq!(h.manager.authenticate(&refreshed.access.token).unwrap().sub, id);
        assert!(refreshed.refresh.is_none());

        let err = h
            .manager
            .refresh(&login.refresh.token, &client(FIREFOX_LINUX))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenMismatch));
    }

    #[tokio::test]
    async fn login_persists_record_cache_history_and_event() {
        let (h, id) = registered().await;
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let hash = hash_refresh_token(&login.refresh.token);

        let record = h.store.get_active_refresh_token(id, "windows_chrome").await.unwrap();
        assert_eq!(record.token_hash, hash);
        assert_eq!(
            h.cache
                .get("refresh:alice@example.com:windows_chrome")
                .await
                .unwrap()
                .as_deref(),
            Some(hash.as_str())
        );

        let history = h.store.login_history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_open());
        assert_eq!(history[0].ip_address.as_deref(), Some("203.0.113.7"));

        let events = h.publisher.events.lock().await;
        let ev = events.last().unwrap();
        assert_eq!(ev.kind, EventKind::Login);
        assert_eq!(ev.metadata.device.as_deref(), Some("windows_chrome"));
    }

    #[tokio::test]
    async fn relogin_on_same_device_keeps_one_active_record() {
        let (h, id) = registered().await;
        let first = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let second = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();

        let active = h.store.list_active_refresh_tokens(id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token_hash, hash_refresh_token(&second.refresh.token));

        let history = h.store.login_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].logout_reason.as_deref(), Some("superseded"));
        assert!(!history[0].is_open());
        assert!(history[1].is_open());

        let err = h
            .manager
            .refresh(&first.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenMismatch));
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_look_the_same() {
        let (h, _) = registered().await;
        let unknown = h
            .manager
            .login("nobody@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        let wrong = h
            .manager
            .login("alice@example.com", "wrong-pass", &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(unknown, AuthError::InvalidCredential));
        assert!(matches!(wrong, AuthError::InvalidCredential));
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_attempt_is_rate_limited_even_with_correct_password() {
        let (h, id) = registered().await;
        for _ in 0..5 {
            let err = h
                .manager
                .login("alice@example.com", "wrong-pass", &client(CHROME_WINDOWS))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredential));
        }
        let err = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
        assert!(h.store.login_history(id).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        h.manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn login_succeeds_when_cache_writes_fail() {
        let h = harness_with(
            AppConfig::for_tests(),
            Arc::new(FlakyCache::default()),
            RecordingPublisher::default(),
        );
        let id = h.manager.register(alice()).await.unwrap();
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        assert!(h.store.get_active_refresh_token(id, "windows_chrome").await.is_ok());

        // cache reads fail too, so refresh must be decided by the store
        h.manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let err = h
            .manager
            .refresh(&login.refresh.token, &client(FIREFOX_LINUX))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenMismatch));
    }

    #[tokio::test]
    async fn refresh_repopulates_cache_from_store() {
        let (h, _) = registered().await;
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let key = "refresh:alice@example.com:windows_chrome";
        h.cache.delete(key).await.unwrap();

        h.manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap();
        assert_eq!(
            h.cache.get(key).await.unwrap(),
            Some(hash_refresh_token(&login.refresh.token))
        );
    }

    #[tokio::test]
    async fn refresh_without_any_session_is_not_found() {
        let (h, id) = registered().await;
        let stray = h
            .manager
            .tokens()
            .issue_refresh(id, "alice@example.com")
            .unwrap();
        let err = h
            .manager
            .refresh(&stray.token, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionNotFound));
    }

    #[tokio::test]
    async fn refresh_rejects_access_tokens_and_garbage() {
        let (h, _) = registered().await;
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let err = h
            .manager
            .refresh(&login.access.token, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));
        let err = h
            .manager
            .refresh("garbage", &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));
    }

    #[tokio::test]
    async fn refresh_with_expired_jwt_is_expired_not_invalid() {
        let (h, id) = registered().await;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: id,
            email: "alice@example.com".into(),
            iat: now - 120,
            exp: now - 60,
            iss: "test-issuer".into(),
            aud: "test-aud".into(),
            kind: TokenKind::Refresh,
            jti: Uuid::new_v4(),
        };
        let expired = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"test-refresh-secret"),
        )
        .unwrap();

        let err = h
            .manager
            .refresh(&expired, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn refresh_against_lapsed_store_record_is_expired() {
        let (h, id) = registered().await;
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        // the JWT is still valid but the stored record has lapsed
        h.store
            .create_refresh_token(
                id,
                &hash_refresh_token(&login.refresh.token),
                "windows_chrome",
                OffsetDateTime::now_utc() - time::Duration::minutes(1),
            )
            .await
            .unwrap();
        h.cache
            .delete("refresh:alice@example.com:windows_chrome")
            .await
            .unwrap();

        let err = h
            .manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn rotation_replaces_the_refresh_token_when_enabled() {
        let mut config = AppConfig::for_tests();
        config.session.rotate_refresh_on_use = true;
        let h = harness_with(config, Arc::new(MemoryCache::new()), RecordingPublisher::default());
        h.manager.register(alice()).await.unwrap();
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();

        let out = h
            .manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let next = out.refresh.expect("rotated token");

        let err = h
            .manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenMismatch));
        h.manager
            .refresh(&next.token, &client(CHROME_WINDOWS))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn logout_invalidates_refresh_and_is_idempotent() {
        let (h, id) = registered().await;
        let login = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();

        h.manager
            .logout(id, "alice@example.com", CHROME_WINDOWS)
            .await
            .unwrap();
        h.manager
            .logout(id, "alice@example.com", CHROME_WINDOWS)
            .await
            .unwrap();

        let err = h
            .manager
            .refresh(&login.refresh.token, &client(CHROME_WINDOWS))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::SessionNotFound | AuthError::TokenMismatch
        ));

        let history = h.store.login_history(id).await.unwrap();
        assert_eq!(history[0].logout_reason.as_deref(), Some("user_logout"));
    }

    #[tokio::test]
    async fn revoke_all_sessions_kills_every_device() {
        let (h, id) = registered().await;
        let chrome = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(CHROME_WINDOWS))
            .await
            .unwrap();
        let firefox = h
            .manager
            .login("alice@example.com", "Str0ng!Pass", &client(FIREFOX_LINUX))
            .await
            .unwrap();

        let handle = h
            .manager
            .issue_revocation_link("alice@example.com")
            .await
            .unwrap();
        h.manager.revoke_all_sessions(&handle).await.unwrap();

        for (token, ua) in [
            (&chrome.refresh.token, CHROME_WINDOWS),
            (&firefox.refresh.token, FIREFOX_LINUX),
        ] {
            assert!(h.manager.refresh(token, &client(ua)).await.is_err());
        }
        assert!(h.store.list_active_refresh_tokens(id).await.unwrap().is_empty());
        let history = h.store.login_history(id).await.unwrap();
        assert!(history
            .iter()
            .all(|r| r.logout_reason.as_deref() == Some("token_revoked")));

        // the marker is consumed
        let err = h.manager.revoke_all_sessions(&handle).await.unwrap_err();
        assert!(matches!(err, AuthError::ExpiredRevocationLink));
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_link_expires_with_its_marker() {
        let (h, _) = registered().await;
        let handle = h
            .manager
            .issue_revocation_link("alice@example.com")
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        let err = h.manager.revoke_all_sessions(&handle).await.unwrap_err();
        assert!(matches!(err, AuthError::ExpiredRevocationLink));
    }

    #[tokio::test]
    async fn superseded_or_malformed_handles_are_rejected() {
        let (h, _) = registered().await;
        let old = h
            .manager
            .issue_revocation_link("alice@example.com")
            .await
            .unwrap();
        let _new = h
            .manager
            .issue_revocation_link("alice@example.com")
            .await
            .unwrap();
        let err = h.manager.revoke_all_sessions(&old).await.unwrap_err();
        assert!(matches!(err, AuthError::ExpiredRevocationLink));

        let err = h.manager.revoke_all_sessions("not-a-handle").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));
    }

    #[tokio::test]
    async fn profile_is_read_through_and_invalidated_on_update() {
        let (h, id) = registered().await;
        let key = format!("user:{id}");
        assert!(h.cache.get(&key).await.unwrap().is_none());

        let p = h.manager.profile(id).await.unwrap();
        assert_eq!(p.first_name, "Alice");
        assert!(h.cache.get(&key).await.unwrap().is_some());

        let updated = h
            .manager
            .update_profile(
                id,
                ProfileUpdate {
                    first_name: Some("Alicia".into()),
                    last_name: Some(String::new()),
                    birth_date: Some("1990-04-12".into()),
                    gender: Some("female".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.first_name, "Alicia");
        assert_eq!(updated.last_name, "Liddell");
        assert!(h.cache.get(&key).await.unwrap().is_none());

        let fresh = h.manager.profile(id).await.unwrap();
        assert_eq!(fresh.first_name, "Alicia");
        assert_eq!(fresh.last_name, "Liddell");
        assert_eq!(fresh.gender, Some(Gender::Female));
        assert_eq!(fresh.birth_date.map(|d| d.to_string()).as_deref(), Some("1990-04-12"));
    }

    #[tokio::test]
    async fn profile_update_validates_fields() {
        let (h, id) = registered().await;
        let err = h
            .manager
            .update_profile(
                id,
                ProfileUpdate {
                    birth_date: Some("12/04/1990".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(_)));

        let err = h
            .manager
            .update_profile(
                id,
                ProfileUpdate {
                    gender: Some("robot".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn profile_of_unknown_user_is_not_found() {
        let h = harness();
        let err = h.manager.profile(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
    }

    #[tokio::test]
    async fn picture_update_uploads_replaces_and_invalidates() {
        let (h, id) = registered().await;
        h.manager.profile(id).await.unwrap();

        let first = h
            .manager
            .update_picture(
                id,
                PictureUpload {
                    file_name: "me.PNG".into(),
                    body: Bytes::from_static(b"\x89PNG"),
                },
            )
            .await
            .unwrap();
        assert!(first.starts_with(&format!("profiles/{id}/")));
        assert!(first.ends_with(".png"));
        assert!(h.storage.contains(&first).await);
        assert!(h.cache.get(&format!("user:{id}")).await.unwrap().is_none());

        let second = h
            .manager
            .update_picture(
                id,
                PictureUpload {
                    file_name: "me.jpeg".into(),
                    body: Bytes::from_static(b"jpeg"),
                },
            )
            .await
            .unwrap();
        assert!(h.storage.contains(&second).await);
        assert!(!h.storage.contains(&first).await);
        assert_eq!(h.manager.profile(id).await.unwrap().picture, Some(second));
    }

    #[tokio::test]
    async fn picture_upload_is_removed_when_store_update_fails() {
        let (h, id) = registered().await;
        // a cached profile whose row is gone from the store
        let profile = h.manager.profile(id).await.unwrap();
        let ghost = Uuid::new_v4();
        h.cache
            .set(
                &keys::profile(ghost),
                &serde_json::to_string(&profile).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = h
            .manager
            .update_picture(
                ghost,
                PictureUpload {
                    file_name: "me.png".into(),
                    body: Bytes::from_static(b"\x89PNG"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
        assert!(h.storage.is_empty().await);
    }

    #[tokio::test]
    async fn picture_update_rejects_bad_type_and_size() {
        let (h, id) = registered().await;
        let err = h
            .manager
            .update_picture(
                id,
                PictureUpload {
                    file_name: "me.gif".into(),
                    body: Bytes::from_static(b"gif"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(_)));

        let err = h
            .manager
            .update_picture(
                id,
                PictureUpload {
                    file_name: "big.jpg".into(),
                    body: Bytes::from(vec![0u8; MAX_PICTURE_BYTES + 1]),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn change_password_requires_current_and_emits_event() {
        let (h, id) = registered().await;
        let err = h
            .manager
            .change_password(id, "wrong-pass", "N3w!Passw0rd")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));

        h.manager
            .change_password(id, "Str0ng!Pass", "N3w!Passw0rd")
            .await
            .unwrap();
        h.manager
            .login("alice@example.com", "N3w!Passw0rd", &client(CHROME_WINDOWS))
            .await
            .unwrap();

        let events = h.publisher.events.lock().await;
        assert!(events.iter().any(|e| e.kind == EventKind::PasswordChanged));
    }
}
