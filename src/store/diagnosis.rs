use sqlx::SqlitePool;
use tracing::instrument;

use crate::model::{Prediction, TumorClass};
use crate::models::diagnosis::DiagnosisModel;

#[derive(Clone, Debug)]
pub struct DiagnosisRepository {
    pool: SqlitePool,
}

impl DiagnosisRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(name = "Recording diagnosis", skip(self, prediction), fields(predicted_class = %prediction.predicted_class))]
    pub async fn record(
        &self,
        user_id: i64,
        prediction: &Prediction,
        image_path: &str,
    ) -> anyhow::Result<DiagnosisModel> {
        let p = &prediction.probabilities;
        let row = sqlx::query_as::<_, DiagnosisModel>(
            r#"INSERT INTO diagnoses
                (user_id, predicted_class, glioma, meningioma, notumor, pituitary, image_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING id, user_id, predicted_class, glioma, meningioma, notumor, pituitary, image_path, created_at"#,
        )
        .bind(user_id)
        .bind(prediction.predicted_class.as_str())
        .bind(p.get(TumorClass::Glioma) as f64)
        .bind(p.get(TumorClass::Meningioma) as f64)
        .bind(p.get(TumorClass::NoTumor) as f64)
        .bind(p.get(TumorClass::Pituitary) as f64)
        .bind(image_path)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to execute query: {:?}", e);
            e
        })?;
        Ok(row)
    }

    /// Newest first.
    pub async fn history_for_user(&self, user_id: i64) -> anyhow::Result<Vec<DiagnosisModel>> {
        let rows = sqlx::query_as::<_, DiagnosisModel>(
            r#"SELECT id, user_id, predicted_class, glioma, meningioma, notumor, pituitary, image_path, created_at
            FROM diagnoses
            WHERE user_id = ?1
            ORDER BY id DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
