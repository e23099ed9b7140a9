use std::sync::Arc;

use anyhow::Context;
use tracing::instrument;

use crate::errors::UploadError;
use crate::media::MediaStore;
use crate::model::{Prediction, Predictor};
use crate::models::diagnosis::DiagnosisModel;
use crate::models::user::{NewUser, UserModel};
use crate::notifier::Notifier;
use crate::store::{DiagnosisRepository, UserRepository};

const ALLOWED_TYPES: [&str; 3] = ["image/jpeg", "image/jpg", "image/png"];

#[derive(Debug, Default)]
pub struct UploadForm {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub image: Option<UploadedImage>,
}

#[derive(Debug)]
pub struct UploadedImage {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// A form that passed validation.
struct ValidUpload<'a> {
    name: &'a str,
    phone: &'a str,
    email: &'a str,
    image: &'a UploadedImage,
}

#[derive(Debug)]
pub struct DiagnosisOutcome {
    pub user: UserModel,
    pub prediction: Prediction,
    pub email_sent: bool,
    /// Newest first, including this upload.
    pub history: Vec<DiagnosisModel>,
}

#[derive(Clone)]
pub struct DiagnosisService {
    users: UserRepository,
    diagnoses: DiagnosisRepository,
    media: MediaStore,
    predictor: Arc<Predictor>,
    notifier: Arc<Notifier>,
    max_upload_bytes: usize,
}

impl DiagnosisService {
    pub fn new(
        users: UserRepository,
        diagnoses: DiagnosisRepository,
        media: MediaStore,
        predictor: Arc<Predictor>,
        notifier: Arc<Notifier>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            users,
            diagnoses,
            media,
            predictor,
            notifier,
            max_upload_bytes,
        }
    }

    pub fn max_upload_mb(&self) -> usize {
        self.max_upload_bytes / (1024 * 1024)
    }

    #[instrument(
        name = "DiagnosisService: process upload",
        skip(self, form),
        fields(email = form.email.as_deref().unwrap_or_default())
    )]
    pub async fn process(&self, form: UploadForm) -> Result<DiagnosisOutcome, UploadError> {
        let upload = self.validate(&form)?;

        let user = self.upsert_user(&upload).await?;
        let prediction = self.classify(&user).await?;

        self.diagnoses
            .record(user.id, &prediction, &user.mri_image)
            .await
            .context("failed to save diagnosis")?;

        let email_sent = self.notifier.send(&user, &prediction).await;

        // the diagnosis is already saved, a failed history read only hides past scans
        let history = match self.diagnoses.history_for_user(user.id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(user_id = user.id, "Failed to load diagnosis history: {:?}", e);
                Vec::new()
            }
        };

        Ok(DiagnosisOutcome {
            user,
            prediction,
            email_sent,
            history,
        })
    }

    fn validate<'a>(&self, form: &'a UploadForm) -> Result<ValidUpload<'a>, UploadError> {
        let present = |value: &'a Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let (Some(name), Some(phone), Some(email), Some(image)) = (
            present(&form.name),
            present(&form.phone),
            present(&form.email),
            form.image.as_ref().filter(|image| !image.bytes.is_empty()),
        ) else {
            return Err(UploadError::MissingFields);
        };

        if image.bytes.len() > self.max_upload_bytes {
            return Err(UploadError::FileTooLarge {
                limit_mb: self.max_upload_mb(),
            });
        }

        let allowed = image
            .content_type
            .as_deref()
            .map(|content_type| ALLOWED_TYPES.contains(&content_type.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !allowed {
            return Err(UploadError::UnsupportedType(image.content_type.clone()));
        }

        Ok(ValidUpload {
            name,
            phone,
            email,
            image,
        })
    }

    /// Email is the only key. Name, phone and image are overwritten in place.
    #[instrument(name = "DiagnosisService: upsert user", skip(self, upload))]
    async fn upsert_user(&self, upload: &ValidUpload<'_>) -> Result<UserModel, UploadError> {
        let stored = self
            .media
            .save(&upload.image.file_name, &upload.image.bytes)
            .await
            .context("failed to store uploaded image")?;

        let result = self.write_user(upload, &stored).await;
        if result.is_err() {
            if let Err(e) = self.media.remove(&stored).await {
                tracing::warn!("Failed to clean up {}: {}", stored, e);
            }
        }
        result
    }

    async fn write_user(&self, upload: &ValidUpload<'_>, stored: &str) -> Result<UserModel, UploadError> {
        let existing = self
            .users
            .find_by_email(upload.email)
            .await
            .context("failed to look up user")?;

        let Some(mut user) = existing else {
            let user = self
                .users
                .create(&NewUser {
                    email: upload.email,
                    phone: upload.phone,
                    name: upload.name,
                    mri_image: stored,
                })
                .await
                .context("failed to create user")?;
            tracing::info!(user_id = user.id, "Created user");
            return Ok(user);
        };

        if user.name != upload.name {
            user.name = upload.name.to_string();
        }
        if user.phone != upload.phone {
            tracing::info!(user_id = user.id, "Phone number changed for existing email");
            user.phone = upload.phone.to_string();
        }

        let previous = std::mem::replace(&mut user.mri_image, stored.to_string());
        self.users
            .update(&mut user)
            .await
            .context("failed to update user")?;

        if !previous.is_empty() && previous != stored {
            if let Err(e) = self.media.remove(&previous).await {
                tracing::warn!("Failed to remove superseded image {}: {}", previous, e);
            }
        }

        tracing::info!(user_id = user.id, "Updated user");
        Ok(user)
    }

    async fn classify(&self, user: &UserModel) -> Result<Prediction, UploadError> {
        let predictor = self.predictor.clone();
        let path = self.media.absolute(&user.mri_image);

        let result = tokio::task::spawn_blocking(move || predictor.predict(&path))
            .await
            .context("prediction task panicked")?;

        result.map_err(|e| {
            tracing::error!("Could not classify upload: {}", e);
            UploadError::ProcessingFailed
        })
    }
}
