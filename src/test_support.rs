use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::model::{Classifier, ImageBatch};
use crate::notifier::{Email, Mailer};

pub const TEMPLATES_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/templates/email");

/// Dark images read as glioma, bright ones as no tumor.
#[derive(Clone, Default)]
pub struct StubClassifier {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl StubClassifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for StubClassifier {
    fn classify(&self, batch: &ImageBatch) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("session run failed");
        }
        let values = batch.as_slice();
        let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
        if mean > 0.5 {
            Ok(vec![0.05, 0.05, 0.85, 0.05])
        } else {
            Ok(vec![0.7, 0.1, 0.1, 0.1])
        }
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn deliver(&self, email: Email) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

pub fn write_image(path: &Path, width: u32, height: u32, rgb: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image::RgbImage::from_pixel(width, height, image::Rgb(rgb))
        .save(path)
        .unwrap();
}

pub fn png_bytes(rgb: [u8; 3]) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(20, 20, image::Rgb(rgb)))
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .unwrap();
    bytes.into_inner()
}

/// Full router over an in-memory database, the bundled templates and stub seams.
pub async fn test_app() -> (tempfile::TempDir, axum::Router) {
    use crate::media::MediaStore;
    use crate::model::Predictor;
    use crate::notifier::Notifier;
    use crate::services::DiagnosisService;
    use crate::startup::{router, AppState};
    use crate::store::{memory_pool, DiagnosisRepository, TemplateRepository, UserRepository};

    let dir = tempfile::tempdir().unwrap();
    let pool = memory_pool().await;
    let media = MediaStore::new(dir.path().join("media"));
    let notifier = Arc::new(
        Notifier::new(
            TEMPLATES_DIR,
            TemplateRepository::new(pool.clone()),
            media.clone(),
            Arc::new(RecordingMailer::default()),
        )
        .await
        .unwrap(),
    );
    let diagnosis = DiagnosisService::new(
        UserRepository::new(pool.clone()),
        DiagnosisRepository::new(pool),
        media.clone(),
        Arc::new(Predictor::new(Box::new(StubClassifier::default()), 16)),
        notifier.clone(),
        10 * 1024 * 1024,
    );

    let app = router(
        AppState {
            diagnosis,
            notifier,
        },
        media.root(),
        12 * 1024 * 1024,
    );
    (dir, app)
}
