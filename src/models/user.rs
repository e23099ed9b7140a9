use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserModel {
    pub id: i64,
    pub email: String,
    pub phone: String,
    pub name: String,
    /// Relative to the media root.
    pub mri_image: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub phone: &'a str,
    pub name: &'a str,
    pub mri_image: &'a str,
}
