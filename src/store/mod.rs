pub mod diagnosis;
pub mod template;
pub mod user;

pub use diagnosis::DiagnosisRepository;
pub use template::TemplateRepository;
pub use user::UserRepository;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::configuration::DatabaseSettings;

pub async fn connect(settings: &DatabaseSettings) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(2))
        .connect_with(settings.connect_options()?)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Single connection, every `sqlite::memory:` connection is its own database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}
