pub mod diagnosis;

pub use diagnosis::{DiagnosisOutcome, DiagnosisService, UploadForm, UploadedImage};
