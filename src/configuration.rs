use std::path::PathBuf;
use std::str::FromStr;

use config::{Config, File};
use secrecy::SecretString;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::ConnectOptions;

#[derive(Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub model: ModelSettings,
    pub email: EmailSettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,

    /// Hard cap on request bodies, above the upload limit so oversized
    /// files still reach validation and get a readable error.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub body_limit_mb: usize,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_upload_mb: usize,

    pub media_root: PathBuf,
}

impl ApplicationSettings {
    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> Result<SqliteConnectOptions, sqlx::Error> {
        Ok(SqliteConnectOptions::from_str(&self.url)?
            .create_if_missing(true)
            .log_statements(tracing_log::log::LevelFilter::Trace))
    }
}

#[derive(Deserialize, Clone)]
pub struct ModelSettings {
    pub path: PathBuf,
    /// Fetched into `path` at startup when the artifact is missing.
    pub url: Option<String>,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub input_size: u32,

    pub input_operation: String,
    pub output_operation: String,
}

#[derive(Deserialize)]
pub struct EmailSettings {
    pub smtp_host: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub smtp_port: u16,

    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub starttls: bool,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_secs: u64,

    pub from: String,
    pub templates_dir: PathBuf,
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn to_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`",
                other
            )),
        }
    }
}

pub fn get_configuration() -> anyhow::Result<Settings> {
    let base_path = std::env::current_dir()?;
    let configuration_directory = base_path.join("configurations");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(anyhow::Error::msg)?;

    let settings = Config::builder()
        .add_source(File::from(configuration_directory.join("base")))
        .add_source(File::from(
            configuration_directory.join(environment.to_str()),
        ))
        // APP_EMAIL__SMTP_HOST=... sets email.smtp_host
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        );

    Ok(settings.build()?.try_deserialize()?)
}
