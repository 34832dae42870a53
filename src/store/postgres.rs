use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::{Date, OffsetDateTime};
use tracing::{debug, error};
use uuid::Uuid;

use super::{
    CredentialStore, LoginHistory, LogoutReason, NewLogin, NewProfile, Profile, ProfileFields,
    RefreshTokenRecord, StoreError, User,
};

/// Postgres-backed [`CredentialStore`].
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(FromRow)]
struct ProfileRow {
    user_id: Uuid,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    phone: Option<String>,
    picture: Option<String>,
    birth_date: Option<Date>,
    gender: Option<String>,
    verified: bool,
    created_at: OffsetDateTime,
    updated_at: Option<OffsetDateTime>,
}

impl From<ProfileRow> for Profile {
    fn from(r: ProfileRow) -> Self {
        Self {
            user_id: r.user_id,
            email: r.email,
            first_name: r.first_name.unwrap_or_default(),
            last_name: r.last_name.unwrap_or_default(),
            phone: r.phone.unwrap_or_default(),
            picture: r.picture.filter(|p| !p.is_empty()),
            birth_date: r.birth_date,
            gender: r.gender.and_then(|g| g.parse().ok()),
            verified: r.verified,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

fn map_unique(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Duplicate,
        other => StoreError::Database(other),
    }
}

fn expect_row(rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        profile: &NewProfile,
    ) -> Result<Uuid, StoreError> {
        let user_id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(password_hash)
        .execute(&mut *tx)
        .await
        .map_err(map_unique)?;

        sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, first_name, last_name)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, %user_id, "insert profile failed; rolling back");
            StoreError::Database(e)
        })?;

        // Dropping `tx` on any error above rolls back the identity row too.
        tx.commit().await?;
        debug!(%user_id, "user created");
        Ok(user_id)
    }

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, created_at
            FROM users
            WHERE email = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, created_at
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users SET password_hash = $1, updated_at = now()
            WHERE id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(password_hash)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        expect_row(res.rows_affected())
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Profile, StoreError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT u.id AS user_id, u.email, p.first_name, p.last_name, p.phone, p.picture,
                   p.birth_date, p.gender, p.verified, p.created_at, p.updated_at
            FROM users u
            JOIN user_profiles p ON p.user_id = u.id
            WHERE u.id = $1 AND u.deleted_at IS NULL AND p.deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.into())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileFields,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE user_profiles
               SET first_name = $1, last_name = $2, birth_date = $3, gender = $4,
                   updated_at = now()
             WHERE user_id = $5 AND deleted_at IS NULL
            "#,
        )
        .bind(&fields.first_name)
        .bind(&fields.last_name)
        .bind(fields.birth_date)
        .bind(fields.gender.map(|g| g.as_str()))
        .bind(user_id)
        .execute(&self.db)
        .await?;
        expect_row(res.rows_affected())
    }

    async fn update_picture(&self, user_id: Uuid, picture: &str) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE user_profiles SET picture = $1, updated_at = now()
             WHERE user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(picture)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        expect_row(res.rows_affected())
    }

    async fn create_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;

        // Serializes concurrent logins of the same user so the partial unique
        // index never sees two active rows for one device.
        sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;

        sqlx::query(
            r#"
            UPDATE refresh_tokens SET is_active = FALSE
             WHERE user_id = $1 AND device = $2 AND is_active
            "#,
        )
        .bind(user_id)
        .bind(device)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, device, expires_at, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(token_hash)
        .bind(device)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(map_unique)?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_active_refresh_token(
        &self,
        user_id: Uuid,
        device: &str,
    ) -> Result<RefreshTokenRecord, StoreError> {
        sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            SELECT id, user_id, token_hash, device, expires_at, is_active, created_at
              FROM refresh_tokens
             WHERE user_id = $1 AND device = $2 AND is_active
            "#,
        )
        .bind(user_id)
        .bind(device)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn list_active_refresh_tokens(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            SELECT id, user_id, token_hash, device, expires_at, is_active, created_at
              FROM refresh_tokens
             WHERE user_id = $1 AND is_active
             ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn deactivate_refresh_token(
        &self,
        user_id: Uuid,
        device: &str,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "UPDATE refresh_tokens SET is_active = FALSE WHERE user_id = $1 AND device = $2 AND is_active",
        )
        .bind(user_id)
        .bind(device)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn deactivate_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "UPDATE refresh_tokens SET is_active = FALSE WHERE user_id = $1 AND is_active",
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn open_login(&self, login: NewLogin<'_>) -> Result<i64, StoreError> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            UPDATE login_history SET logout_time = now(), logout_reason = $1
             WHERE user_id = $2 AND device = $3 AND logout_time IS NULL
            "#,
        )
        .bind(LogoutReason::Superseded.as_str())
        .bind(login.user_id)
        .bind(login.device)
        .execute(&mut *tx)
        .await?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO login_history (user_id, login_time, ip_address, user_agent, device)
            VALUES ($1, now(), $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(login.user_id)
        .bind(login.ip_address)
        .bind(login.user_agent)
        .bind(login.device)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn close_login(
        &self,
        user_id: Uuid,
        device: &str,
        reason: LogoutReason,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE login_history SET logout_time = now(), logout_reason = $1
             WHERE user_id = $2 AND device = $3 AND logout_time IS NULL
            "#,
        )
        .bind(reason.as_str())
        .bind(user_id)
        .bind(device)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn close_all_logins(
        &self,
        user_id: Uuid,
        reason: LogoutReason,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE login_history SET logout_time = now(), logout_reason = $1
             WHERE user_id = $2 AND logout_time IS NULL
            "#,
        )
        .bind(reason.as_str())
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn login_history(&self, user_id: Uuid) -> Result<Vec<LoginHistory>, StoreError> {
        let rows = sqlx::query_as::<_, LoginHistory>(
            r#"
            SELECT id, user_id, login_time, ip_address, user_agent, device, logout_time, logout_reason
              FROM login_history
             WHERE user_id = $1
             ORDER BY login_time ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}
