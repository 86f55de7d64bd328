//! Markdown document writer
//!
//! Files are named `{date}_{slug}_{short id}.md`, e.g.
//! `2024-01-15_weekly-newsletter_18a3f2b9.md`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use unicode_normalization::UnicodeNormalization;

use super::raw_store::write_atomic;
use crate::models::ConvertedEmail;

const MAX_SLUG_LEN: usize = 50;
const SHORT_ID_LEN: usize = 8;

/// Persistence for rendered documents
pub trait MarkdownSink {
    fn write_markdown(&self, email: &ConvertedEmail) -> Result<PathBuf>;
}

pub struct MarkdownWriter {
    output_dir: PathBuf,
}

impl MarkdownWriter {
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create markdown directory {}", output_dir.display())
        })?;
        Ok(Self { output_dir })
    }

    pub fn filename_for(email: &ConvertedEmail) -> String {
        let date = email.header.date.format("%Y-%m-%d");
        let slug = slugify(&email.header.subject);
        let id = email.message_id.as_str();
        let short_id: String = id.chars().take(SHORT_ID_LEN).collect();
        format!("{}_{}_{}.md", date, slug, short_id)
    }
}

impl MarkdownSink for MarkdownWriter {
    fn write_markdown(&self, email: &ConvertedEmail) -> Result<PathBuf> {
        let path = self.output_dir.join(Self::filename_for(email));
        write_atomic(&path, &email.markdown)?;
        log::debug!("[WRITER] Wrote markdown: {}", path.display());
        Ok(path)
    }
}

/// Lowercase ASCII slug with runs of anything else collapsed to `-`
///
/// Text is NFKD-decomposed first, so accented letters keep their base
/// letter (`é` becomes `e`) once the combining marks are dropped.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    for c in text.nfkd() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
        // Punctuation, combining marks and other non-ASCII are dropped
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}
