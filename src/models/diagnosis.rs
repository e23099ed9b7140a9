use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::model::{Prediction, Probabilities, TumorClass};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DiagnosisModel {
    pub id: i64,
    pub user_id: i64,
    pub predicted_class: String,
    pub glioma: f64,
    pub meningioma: f64,
    pub notumor: f64,
    pub pituitary: f64,
    pub image_path: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DiagnosisModel {
    pub fn to_prediction(&self) -> anyhow::Result<Prediction> {
        let predicted_class = self
            .predicted_class
            .parse::<TumorClass>()
            .map_err(anyhow::Error::msg)?;

        Ok(Prediction {
            predicted_class,
            probabilities: Probabilities::new([
                self.glioma as f32,
                self.meningioma as f32,
                self.notumor as f32,
                self.pituitary as f32,
            ]),
        })
    }
}
