use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::{context, Environment};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::configuration::EmailSettings;
use crate::media::MediaStore;
use crate::model::Prediction;
use crate::models::email_template::TemplateKind;
use crate::models::user::UserModel;
use crate::store::TemplateRepository;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("email template for {0} not found")]
    MissingTemplate(TemplateKind),
    #[error("failed to render template: {0}")]
    Render(#[from] minijinja::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("failed to read attachment: {0}")]
    Attachment(io::Error),
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub attachment: Option<EmailAttachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, email: Email) -> anyhow::Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_settings(settings: &EmailSettings) -> anyhow::Result<Self> {
        let mut builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
        };
        builder = builder
            .port(settings.smtp_port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)));

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from: settings.from.parse()?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(&self, email: Email) -> anyhow::Result<()> {
        let message = build_message(&self.from, &email)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// HTML body, plus the scan as a second part when there is one.
pub fn build_message(from: &Mailbox, email: &Email) -> Result<Message, NotifyError> {
    let builder = Message::builder()
        .from(from.clone())
        .to(email.to.parse::<Mailbox>()?)
        .subject(email.subject.clone());

    let html = SinglePart::html(email.html.clone());
    let message = match &email.attachment {
        Some(attachment) => {
            let content_type = ContentType::parse(&attachment.content_type)
                .map_err(|e| NotifyError::Build(e.to_string()))?;
            builder.multipart(
                MultiPart::mixed().singlepart(html).singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.content.clone(), content_type),
                ),
            )
        }
        None => builder.singlepart(html),
    };

    message.map_err(|e| NotifyError::Build(e.to_string()))
}

#[derive(Debug, Clone)]
struct CachedTemplate {
    subject: String,
    body: String,
}

/// Sends the result email. Templates are read once at construction and kept
/// in memory; `reload` re-reads them from disk and mirrors them to the store.
pub struct Notifier {
    templates_dir: PathBuf,
    repo: TemplateRepository,
    media: MediaStore,
    mailer: Arc<dyn Mailer>,
    cache: RwLock<HashMap<TemplateKind, CachedTemplate>>,
}

impl Notifier {
    pub async fn new(
        templates_dir: impl Into<PathBuf>,
        repo: TemplateRepository,
        media: MediaStore,
        mailer: Arc<dyn Mailer>,
    ) -> anyhow::Result<Self> {
        let notifier = Self {
            templates_dir: templates_dir.into(),
            repo,
            media,
            mailer,
            cache: RwLock::new(HashMap::new()),
        };
        notifier.reload().await?;
        Ok(notifier)
    }

    /// Returns the kinds that are available after the reload.
    #[instrument(name = "Notifier: reload templates", skip(self))]
    pub async fn reload(&self) -> anyhow::Result<Vec<TemplateKind>> {
        let mut loaded = HashMap::new();

        for kind in TemplateKind::ALL {
            let path = self.templates_dir.join(kind.file_name());
            match tokio::fs::read_to_string(&path).await {
                Ok(body) => {
                    self.repo.upsert(kind, kind.subject(), &body).await?;
                    loaded.insert(
                        kind,
                        CachedTemplate {
                            subject: kind.subject().to_string(),
                            body,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Cannot read email template: {}", e);
                    if let Some(row) = self.repo.find(kind).await? {
                        tracing::info!(template = %kind, "Using stored copy of email template");
                        loaded.insert(
                            kind,
                            CachedTemplate {
                                subject: row.subject,
                                body: row.body,
                            },
                        );
                    }
                }
            }
        }

        let kinds = TemplateKind::ALL
            .into_iter()
            .filter(|kind| loaded.contains_key(kind))
            .collect();
        *self.cache.write().await = loaded;
        Ok(kinds)
    }

    /// Never fails the caller; any problem is logged and reported as `false`.
    #[instrument(name = "Notifier: send result email", skip_all, fields(email = %user.email))]
    pub async fn send(&self, user: &UserModel, prediction: &Prediction) -> bool {
        match self.try_send(user, prediction).await {
            Ok(()) => {
                tracing::info!("Result email sent");
                true
            }
            Err(NotifyError::MissingTemplate(kind)) => {
                tracing::error!("Email template for {} not found.", kind);
                false
            }
            Err(e) => {
                tracing::error!("Failed to send email to {}: {}", user.email, e);
                false
            }
        }
    }

    async fn try_send(&self, user: &UserModel, prediction: &Prediction) -> Result<(), NotifyError> {
        let kind = TemplateKind::for_class(prediction.predicted_class);
        let template = self
            .cache
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or(NotifyError::MissingTemplate(kind))?;

        let html = render(kind, &template.body, user, prediction)?;
        let attachment = self.attachment_for(&user.mri_image).await?;

        self.mailer
            .deliver(Email {
                to: user.email.clone(),
                subject: template.subject,
                html,
                attachment,
            })
            .await
            .map_err(NotifyError::Transport)
    }

    async fn attachment_for(&self, relative: &str) -> Result<Option<EmailAttachment>, NotifyError> {
        let path = self.media.absolute(relative);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NotifyError::Attachment(e)),
        };

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mri_image".to_string());

        Ok(Some(EmailAttachment {
            filename,
            content_type: content_type_for(&path).to_string(),
            content,
        }))
    }
}

fn render(
    kind: TemplateKind,
    body: &str,
    user: &UserModel,
    prediction: &Prediction,
) -> Result<String, NotifyError> {
    let env = Environment::new();
    // named with .html so autoescaping applies to user supplied fields
    let template = env.template_from_named_str(kind.file_name(), body)?;
    Ok(template.render(context! {
        name => &user.name,
        phone => &user.phone,
        email => &user.email,
        predicted_class => prediction.predicted_class.as_str(),
        probabilities => &prediction.probabilities,
    })?)
}

fn content_type_for(path: &Path) -> &'static str {
    match image::ImageFormat::from_path(path) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::NewUser;
    use crate::store::{memory_pool, UserRepository};
    use crate::test_support::{write_image, RecordingMailer};

    struct Fixture {
        _dir: tempfile::TempDir,
        templates_dir: PathBuf,
        media: MediaStore,
        repo: TemplateRepository,
        user: UserModel,
    }

    async fn fixture(with_templates: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let templates_dir = dir.path().join("templates");
        std::fs::create_dir_all(&templates_dir).unwrap();
        if with_templates {
            std::fs::write(
                templates_dir.join("email_no_tumor.html"),
                "<p>Good news {{ name }}: {{ predicted_class }}</p>",
            )
            .unwrap();
            std::fs::write(
                templates_dir.join("email_tumor.html"),
                "<p>{{ name }} ({{ phone }}): {{ predicted_class }}</p>\
                 {% for label, p in probabilities|items %}<li>{{ label }}</li>{% endfor %}",
            )
            .unwrap();
        }

        let media = MediaStore::new(dir.path().join("media"));
        write_image(&media.absolute("mri_images/scan.png"), 8, 8, [1, 2, 3]);

        let pool = memory_pool().await;
        let user = UserRepository::new(pool.clone())
            .create(&NewUser {
                email: "ada@example.com",
                phone: "555-0100",
                name: "Ada <Lovelace>",
                mri_image: "mri_images/scan.png",
            })
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            templates_dir,
            media,
            repo: TemplateRepository::new(pool),
            user,
        }
    }

    async fn notifier(f: &Fixture, mailer: Arc<dyn Mailer>) -> Notifier {
        Notifier::new(&f.templates_dir, f.repo.clone(), f.media.clone(), mailer)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn tumor_result_uses_tumor_template_with_attachment() {
        let f = fixture(true).await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = notifier(&f, mailer.clone()).await;

        let prediction = Prediction::from_scores(&[0.7, 0.1, 0.1, 0.1]).unwrap();
        assert!(notifier.send(&f.user, &prediction).await);

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].subject, "MRI Scan Result: Tumor Detected");
        assert!(sent[0].html.contains("Ada &lt;Lovelace&gt; (555-0100): glioma"));
        assert!(sent[0].html.contains("<li>glioma</li><li>meningioma</li><li>notumor</li><li>pituitary</li>"));
        let attachment = sent[0].attachment.as_ref().unwrap();
        assert_eq!(attachment.filename, "scan.png");
        assert_eq!(attachment.content_type, "image/png");
    }

    #[tokio::test]
    async fn notumor_result_uses_no_tumor_template() {
        let f = fixture(true).await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = notifier(&f, mailer.clone()).await;

        let prediction = Prediction::from_scores(&[0.1, 0.1, 0.7, 0.1]).unwrap();
        assert!(notifier.send(&f.user, &prediction).await);
        assert_eq!(mailer.sent()[0].subject, "MRI Scan Result: No Tumor Detected");
    }

    #[tokio::test]
    async fn missing_image_sends_without_attachment() {
        let mut f = fixture(true).await;
        f.user.mri_image = "mri_images/gone.png".into();
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = notifier(&f, mailer.clone()).await;

        let prediction = Prediction::from_scores(&[0.1, 0.1, 0.7, 0.1]).unwrap();
        assert!(notifier.send(&f.user, &prediction).await);
        assert!(mailer.sent()[0].attachment.is_none());
    }

    #[tokio::test]
    async fn missing_template_reports_failure() {
        let f = fixture(false).await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = notifier(&f, mailer.clone()).await;

        let prediction = Prediction::from_scores(&[0.7, 0.1, 0.1, 0.1]).unwrap();
        assert!(!notifier.send(&f.user, &prediction).await);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_reports_failure() {
        let f = fixture(true).await;
        let notifier = notifier(&f, Arc::new(RecordingMailer::failing())).await;

        let prediction = Prediction::from_scores(&[0.7, 0.1, 0.1, 0.1]).unwrap();
        assert!(!notifier.send(&f.user, &prediction).await);
    }

    #[tokio::test]
    async fn reload_picks_up_edits_and_falls_back_to_stored_copy() {
        let f = fixture(true).await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = notifier(&f, mailer.clone()).await;
        let prediction = Prediction::from_scores(&[0.1, 0.1, 0.7, 0.1]).unwrap();

        std::fs::write(f.templates_dir.join("email_no_tumor.html"), "<p>edited</p>").unwrap();
        // unchanged until the reload hook runs
        notifier.send(&f.user, &prediction).await;
        assert!(mailer.sent()[0].html.contains("Good news"));

        let kinds = notifier.reload().await.unwrap();
        assert_eq!(kinds, vec![TemplateKind::NoTumor, TemplateKind::Tumor]);
        notifier.send(&f.user, &prediction).await;
        assert_eq!(mailer.sent()[1].html, "<p>edited</p>");

        std::fs::remove_file(f.templates_dir.join("email_no_tumor.html")).unwrap();
        notifier.reload().await.unwrap();
        notifier.send(&f.user, &prediction).await;
        assert_eq!(mailer.sent()[2].html, "<p>edited</p>");
    }

    #[test]
    fn build_message_attaches_the_scan() {
        let from: Mailbox = "MRI Diagnosis <no-reply@example.com>".parse().unwrap();
        let email = Email {
            to: "ada@example.com".into(),
            subject: "MRI Scan Result: Tumor Detected".into(),
            html: "<p>hello</p>".into(),
            attachment: Some(EmailAttachment {
                filename: "scan.png".into(),
                content_type: "image/png".into(),
                content: vec![1, 2, 3],
            }),
        };

        let formatted = String::from_utf8(build_message(&from, &email).unwrap().formatted()).unwrap();
        assert!(formatted.contains("Subject: MRI Scan Result: Tumor Detected"));
        assert!(formatted.contains("To: ada@example.com"));
        assert!(formatted.contains("multipart/mixed"));
        assert!(formatted.contains("filename=\"scan.png\""));
    }

    #[test]
    fn build_message_rejects_bad_recipients() {
        let from: Mailbox = "no-reply@example.com".parse().unwrap();
        let email = Email {
            to: "not an address".into(),
            subject: "s".into(),
            html: "<p></p>".into(),
            attachment: None,
        };
        assert!(matches!(build_message(&from, &email), Err(NotifyError::Address(_))));
    }
}
