use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::configuration::Settings;
use crate::media::MediaStore;
use crate::model::Predictor;
use crate::notifier::{Notifier, SmtpMailer};
use crate::routes::admin::reload_templates;
use crate::routes::health::health_check;
use crate::routes::upload::{index_page, upload_post};
use crate::services::DiagnosisService;
use crate::store::{self, DiagnosisRepository, TemplateRepository, UserRepository};
use crate::utils::ensure_model_exists;

#[derive(Clone)]
pub struct AppState {
    pub diagnosis: DiagnosisService,
    pub notifier: Arc<Notifier>,
}

pub fn router(state: AppState, media_root: &Path, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index_page).post(upload_post))
        .route("/admin/templates/reload", post(reload_templates))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
        .nest_service("/media", ServeDir::new(media_root))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
}

/// Loads the model, opens the database and reads the email templates.
/// Any failure here means the service must not start.
pub async fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    ensure_model_exists(&settings.model).await?;
    let model_settings = settings.model.clone();
    let predictor = tokio::task::spawn_blocking(move || Predictor::from_settings(&model_settings))
        .await
        .context("model loading task panicked")??;

    let pool = store::connect(&settings.database)
        .await
        .context("failed to open database")?;
    let users = UserRepository::new(pool.clone());
    tracing::info!(users = users.count().await?, "Database ready");

    let media = MediaStore::new(&settings.application.media_root);
    tokio::fs::create_dir_all(media.root())
        .await
        .with_context(|| format!("failed to create {}", media.root().display()))?;

    let mailer = SmtpMailer::from_settings(&settings.email).context("invalid email settings")?;
    let notifier = Arc::new(
        Notifier::new(
            &settings.email.templates_dir,
            TemplateRepository::new(pool.clone()),
            media.clone(),
            Arc::new(mailer),
        )
        .await?,
    );

    let diagnosis = DiagnosisService::new(
        users,
        DiagnosisRepository::new(pool),
        media,
        Arc::new(predictor),
        notifier.clone(),
        settings.application.max_upload_bytes(),
    );

    Ok(AppState {
        diagnosis,
        notifier,
    })
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let state = build_state(&settings).await?;
    let app = router(
        state,
        &settings.application.media_root,
        settings.application.body_limit_bytes(),
    );

    let addr: SocketAddr = format!("{}:{}", settings.application.host, settings.application.port)
        .parse()
        .context("invalid listen address")?;
    tracing::info!("Listening on http://{}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
