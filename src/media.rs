use std::io;
use std::path::{Path, PathBuf};

const UPLOAD_DIR: &str = "mri_images";
/// Longest sanitized name kept from the client, extension included.
const MAX_NAME_LEN: usize = 100;
const MAX_EXTENSION_LEN: usize = 16;

/// Uploaded scans on local disk. Paths handed out are relative to `root`.
#[derive(Clone, Debug)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    #[tracing::instrument(name = "Storing uploaded image", skip(self, bytes), fields(size = bytes.len()))]
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> io::Result<String> {
        let dir = self.root.join(UPLOAD_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let unique = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!("{}_{}", &unique[..12], sanitize_file_name(original_name));
        tokio::fs::write(dir.join(&file_name), bytes).await?;

        Ok(format!("{}/{}", UPLOAD_DIR, file_name))
    }

    /// Missing files are fine, the goal is only that the file is gone.
    pub async fn remove(&self, relative: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.absolute(relative)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn sanitize_file_name(name: &str) -> String {
    // drop any client-side directories
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return "upload".to_string();
    }
    if cleaned.len() <= MAX_NAME_LEN {
        return cleaned.to_string();
    }

    // only ASCII survives the mapping above, so byte offsets are char boundaries
    let (stem, extension) = match cleaned.rfind('.') {
        Some(dot) if cleaned.len() - dot <= MAX_EXTENSION_LEN => cleaned.split_at(dot),
        _ => (cleaned, ""),
    };
    let keep = (MAX_NAME_LEN - extension.len()).min(stem.len());
    format!("{}{}", &stem[..keep], extension)
}
