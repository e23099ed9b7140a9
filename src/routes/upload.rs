use askama::Template;
use axum::{
    extract::{multipart::MultipartError, Multipart, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use tracing::instrument;

use crate::errors::UploadError;
use crate::services::{DiagnosisOutcome, UploadForm, UploadedImage};
use crate::startup::AppState;

struct ProbabilityRow {
    label: &'static str,
    percent: String,
}

struct HistoryRow {
    taken_at: String,
    predicted_class: String,
    confidence: String,
}

struct ResultView {
    name: String,
    email: String,
    phone: String,
    image_url: String,
    predicted_class: &'static str,
    tumor: bool,
    probabilities: Vec<ProbabilityRow>,
    history: Vec<HistoryRow>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    error: Option<String>,
    success: Option<String>,
    report: Option<ResultView>,
}

impl From<DiagnosisOutcome> for IndexTemplate {
    fn from(outcome: DiagnosisOutcome) -> Self {
        let (success, error) = if outcome.email_sent {
            (Some("Email report sent to your email.".to_string()), None)
        } else {
            (
                None,
                Some("Failed to send email report. Please check your email settings.".to_string()),
            )
        };

        let prediction = &outcome.prediction;
        let report = ResultView {
            name: outcome.user.name.clone(),
            email: outcome.user.email.clone(),
            phone: outcome.user.phone.clone(),
            image_url: format!("/media/{}", outcome.user.mri_image),
            predicted_class: prediction.predicted_class.as_str(),
            tumor: prediction.predicted_class.is_tumor(),
            probabilities: prediction
                .probabilities
                .iter()
                .map(|(class, probability)| ProbabilityRow {
                    label: class.as_str(),
                    percent: format!("{:.2}", probability * 100.0),
                })
                .collect(),
            history: outcome
                .history
                .iter()
                .filter_map(|row| match row.to_prediction() {
                    Ok(past) => Some(HistoryRow {
                        taken_at: row.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
                        predicted_class: row.predicted_class.clone(),
                        confidence: format!(
                            "{:.2}",
                            past.probabilities.get(past.predicted_class) * 100.0
                        ),
                    }),
                    Err(e) => {
                        tracing::warn!(diagnosis_id = row.id, "Skipping unreadable diagnosis: {}", e);
                        None
                    }
                })
                .collect(),
        };

        IndexTemplate {
            error,
            success,
            report: Some(report),
        }
    }
}

fn render(template: IndexTemplate) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render page: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FlashParams {
    error: Option<String>,
}

pub async fn index_page(Query(params): Query<FlashParams>) -> Response {
    render(IndexTemplate {
        error: params.error,
        success: None,
        report: None,
    })
}

#[instrument(name = "Web: Upload POST", skip(state, multipart))]
pub async fn upload_post(State(state): State<AppState>, multipart: Multipart) -> Response {
    let form = match read_form(multipart, state.diagnosis.max_upload_mb()).await {
        Ok(form) => form,
        Err(e) => {
            tracing::warn!("Unreadable upload: {}", e);
            return e.into_response();
        }
    };

    match state.diagnosis.process(form).await {
        Ok(outcome) => {
            tracing::info!(
                predicted_class = %outcome.prediction.predicted_class,
                email_sent = outcome.email_sent,
                "Upload processed"
            );
            render(outcome.into())
        }
        Err(e) => {
            if e.is_validation() {
                tracing::warn!("Upload rejected: {}", e);
            } else {
                tracing::error!("Upload failed: {:?}", e);
            }
            e.into_response()
        }
    }
}

/// Bodies over the router's length limit fail while streaming, before
/// validation sees the file, so they are reported as oversized here.
fn multipart_error(e: MultipartError, limit_mb: usize) -> UploadError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::FileTooLarge { limit_mb }
    } else {
        UploadError::Unexpected(e.into())
    }
}

async fn read_form(mut multipart: Multipart, limit_mb: usize) -> Result<UploadForm, UploadError> {
    let mut form = UploadForm::default();
    let fail = |e: MultipartError| multipart_error(e, limit_mb);

    while let Some(field) = multipart.next_field().await.map_err(fail)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("name") => form.name = Some(field.text().await.map_err(fail)?),
            Some("phone") => form.phone = Some(field.text().await.map_err(fail)?),
            Some("email") => form.email = Some(field.text().await.map_err(fail)?),
            Some("mri_image") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(fail)?;
                // browsers send an empty part when no file was picked
                if file_name.is_empty() && bytes.is_empty() {
                    continue;
                }
                form.image = Some(UploadedImage {
                    file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    Ok(form)
}
