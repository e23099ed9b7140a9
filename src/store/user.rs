use sqlx::SqlitePool;
use tracing::instrument;

use crate::models::user::{NewUser, UserModel};

#[derive(Clone, Debug)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(name = "Fetching user by email from database", skip(self))]
    pub async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<UserModel>> {
        let user = sqlx::query_as::<_, UserModel>(
            r#"SELECT id, email, phone, name, mri_image, created_at, updated_at
            FROM users WHERE email = ?1"#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch user: {:?}", e);
            e
        })?;
        Ok(user)
    }

    #[instrument(name = "Saving new user to database", skip(self, user), fields(email = %user.email))]
    pub async fn create(&self, user: &NewUser<'_>) -> anyhow::Result<UserModel> {
        let now = chrono::Utc::now();
        let created = sqlx::query_as::<_, UserModel>(
            r#"INSERT INTO users (email, phone, name, mri_image, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING id, email, phone, name, mri_image, created_at, updated_at"#,
        )
        .bind(user.email)
        .bind(user.phone)
        .bind(user.name)
        .bind(user.mri_image)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to execute query: {:?}", e);
            e
        })?;
        Ok(created)
    }

    /// Writes name, phone and image back; the email is the key and never changes.
    #[instrument(name = "Updating user in database", skip(self, user), fields(user_id = user.id))]
    pub async fn update(&self, user: &mut UserModel) -> anyhow::Result<()> {
        user.updated_at = chrono::Utc::now();
        sqlx::query(
            r#"UPDATE users SET phone = ?1, name = ?2, mri_image = ?3, updated_at = ?4
            WHERE id = ?5"#,
        )
        .bind(&user.phone)
        .bind(&user.name)
        .bind(&user.mri_image)
        .bind(user.updated_at)
        .bind(user.id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to execute query: {:?}", e);
            e
        })?;
        Ok(())
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
