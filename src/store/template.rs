use sqlx::SqlitePool;
use tracing::instrument;

use crate::models::email_template::{EmailTemplateModel, TemplateKind};

#[derive(Clone, Debug)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(name = "Upserting email template", skip(self, subject, body))]
    pub async fn upsert(&self, kind: TemplateKind, subject: &str, body: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO email_templates (template_type, subject, body)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (template_type) DO UPDATE SET subject = excluded.subject, body = excluded.body"#,
        )
        .bind(kind.as_str())
        .bind(subject)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(&self, kind: TemplateKind) -> anyhow::Result<Option<EmailTemplateModel>> {
        let row = sqlx::query_as::<_, EmailTemplateModel>(
            "SELECT template_type, subject, body FROM email_templates WHERE template_type = ?1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
