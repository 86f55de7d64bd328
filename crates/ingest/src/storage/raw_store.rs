//! Raw body storage on the local filesystem
//!
//! Layout:
//! ```text
//! raw/
//!   18a3f2b9c0d1e2f3.txt     # text/plain body
//!   18a3f2b9c0d1e2f3.html    # text/html body
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::{EmailBody, MessageId};

/// Where the bodies of one message were written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPaths {
    pub text: Option<PathBuf>,
    pub html: Option<PathBuf>,
}

impl RawPaths {
    pub fn text_string(&self) -> Option<String> {
        self.text.as_ref().map(|p| p.display().to_string())
    }

    pub fn html_string(&self) -> Option<String> {
        self.html.as_ref().map(|p| p.display().to_string())
    }
}

/// Persistence for original message bodies
pub trait RawSink {
    /// Write whichever body flavours are present and return their paths
    fn store_raw(&self, message_id: &MessageId, body: &EmailBody) -> Result<RawPaths>;

    /// Read back bodies previously written by `store_raw`.
    ///
    /// Missing files yield `None` for that flavour rather than an error.
    fn load_raw(&self, text_path: Option<&str>, html_path: Option<&str>) -> Result<EmailBody>;
}

/// Writes bodies as plain files under a single directory
pub struct RawEmailStore {
    root: PathBuf,
}

impl RawEmailStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create raw directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, message_id: &MessageId, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", message_id.as_str(), extension))
    }
}

/// Write to a temp file and rename over the target
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    fs::write(&temp, content).with_context(|| format!("Failed to write {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("Failed to move into {}", path.display()))?;
    Ok(())
}

fn read_optional(path: Option<&str>) -> Result<Option<String>> {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    let path = Path::new(path);
    if !path.exists() {
        log::warn!("[RAW] Missing raw file {}", path.display());
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(content))
}

impl RawSink for RawEmailStore {
    fn store_raw(&self, message_id: &MessageId, body: &EmailBody) -> Result<RawPaths> {
        let mut saved = RawPaths::default();

        if let Some(text) = &body.plain_text {
            let path = self.path_for(message_id, "txt");
            write_atomic(&path, text)?;
            log::debug!("[RAW] Saved text: {}", path.display());
            saved.text = Some(path);
        }

        if let Some(html) = &body.html {
            let path = self.path_for(message_id, "html");
            write_atomic(&path, html)?;
            log::debug!("[RAW] Saved HTML: {}", path.display());
            saved.html = Some(path);
        }

        Ok(saved)
    }

    fn load_raw(&self, text_path: Option<&str>, html_path: Option<&str>) -> Result<EmailBody> {
        Ok(EmailBody {
            plain_text: read_optional(text_path)?,
            html: read_optional(html_path)?,
        })
    }
}
