use axum::response::{IntoResponse, Redirect, Response};
use thiserror::Error;

/// Everything that can stop an upload. The display text is what the user sees.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("All fields are required.")]
    MissingFields,

    #[error("File size must be less than {limit_mb}MB.")]
    FileTooLarge { limit_mb: usize },

    #[error("Only JPEG, JPG, and PNG image files are allowed.")]
    UnsupportedType(Option<String>),

    #[error("Failed to process the MRI image. Please ensure it is a valid brain MRI scan.")]
    ProcessingFailed,

    #[error("An error occurred while processing your request: {0}. Please try again.")]
    Unexpected(#[from] anyhow::Error),
}

impl UploadError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            UploadError::MissingFields
                | UploadError::FileTooLarge { .. }
                | UploadError::UnsupportedType(_)
        )
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let location = format!("/?error={}", urlencoding::encode(&self.to_string()));
        Redirect::to(&location).into_response()
    }
}
