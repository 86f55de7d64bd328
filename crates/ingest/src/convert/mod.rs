//! Markdown rendering with YAML front matter
//!
//! HTML bodies go through `html2text`; when that produces nothing usable the
//! plain-text body is used as-is.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::ConversionError;
use crate::models::{ConvertedEmail, EmailBody, EmailHeader, Label, MessageId};
use crate::pipeline::ConvertSource;

/// Wrap width for rendered HTML
const TEXT_WIDTH: usize = 100;

#[derive(Debug, Serialize)]
struct FrontMatter<'a> {
    subject: &'a str,
    from: &'a str,
    to: &'a str,
    date: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    cc: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    message_id: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    labels: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    label_ids: Vec<&'a str>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownConverter;

impl MarkdownConverter {
    pub fn new() -> Self {
        Self
    }

    fn render_body(&self, message_id: &MessageId, body: &EmailBody) -> Option<String> {
        if let Some(html) = body.html.as_deref() {
            match html2text::from_read(html.as_bytes(), TEXT_WIDTH) {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => log::debug!("[CONVERT] {}: HTML rendered empty, trying plain text", message_id),
                Err(e) => log::warn!("[CONVERT] {}: HTML rendering failed: {}", message_id, e),
            }
        }

        body.plain_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
    }

    fn front_matter(header: &EmailHeader, labels: &[Label]) -> Result<String> {
        let matter = FrontMatter {
            subject: &header.subject,
            from: &header.sender,
            to: &header.to,
            date: header.date.format("%Y-%m-%d %H:%M:%S").to_string(),
            cc: &header.cc,
            message_id: &header.message_id_header,
            labels: labels.iter().map(|l| l.name.as_str()).collect(),
            label_ids: labels.iter().map(|l| l.id.as_str()).collect(),
        };
        let yaml = serde_yaml::to_string(&matter).context("Failed to serialize front matter")?;
        Ok(format!("---\n{}---\n", yaml))
    }
}

impl ConvertSource for MarkdownConverter {
    fn convert(
        &self,
        message_id: &MessageId,
        header: &EmailHeader,
        body: &EmailBody,
        labels: &[Label],
    ) -> Result<ConvertedEmail> {
        let markdown_body = self
            .render_body(message_id, body)
            .ok_or_else(|| ConversionError(message_id.clone()))?;

        let front_matter = Self::front_matter(header, labels)?;

        Ok(ConvertedEmail {
            message_id: message_id.clone(),
            markdown: format!("{}\n{}", front_matter, markdown_body.trim_end()),
            header: header.clone(),
        })
    }
}
