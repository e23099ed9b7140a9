use std::{env, path::Path};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};

use crate::configuration::ModelSettings;

async fn download_file(url: &str, path: &Path) -> anyhow::Result<()> {
    tracing::info!("Downloading {} from {}", path.display(), url);

    let mut header_map = HeaderMap::new();

    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Invalid GITHUB_TOKEN format")?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .context("Failed to send request")?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to download {}: {}", url, response.status());
    }

    let bytes = response.bytes().await.context("Failed to read bytes")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Fetches the classifier artifact when it is missing and a URL is configured.
pub async fn ensure_model_exists(settings: &ModelSettings) -> anyhow::Result<()> {
    tracing::info!("Checking model...");
    if settings.path.exists() {
        return Ok(());
    }

    match settings.url.as_deref() {
        Some(url) => download_file(url, &settings.path).await,
        None => anyhow::bail!(
            "model not found at {} and no model url configured (APP_MODEL__URL)",
            settings.path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(path: std::path::PathBuf, url: Option<String>) -> ModelSettings {
        ModelSettings {
            path,
            url,
            input_size: 299,
            input_operation: "x".into(),
            output_operation: "Identity".into(),
        }
    }

    #[tokio::test]
    async fn present_model_needs_no_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frozen_graph.pb");
        std::fs::write(&path, b"graph").unwrap();

        ensure_model_exists(&settings(path, Some("http://127.0.0.1:9/never".into())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_model_without_url_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_model_exists(&settings(dir.path().join("missing.pb"), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no model url configured"));
    }
}
