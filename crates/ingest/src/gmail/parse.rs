//! Gmail payload parsing
//!
//! Walks the MIME tree of a `format=full` message, decodes base64url bodies
//! and extracts the headers the converter needs.

use anyhow::Result;
use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};

use super::api::{GmailMessage, MessagePart};
use crate::error::ParseError;
use crate::models::{EmailBody, EmailHeader, MessageId, ParsedMessage, ThreadId, epoch};

/// Parse a Gmail API message into a [`ParsedMessage`]
pub fn parse_message(gmail_msg: GmailMessage) -> Result<ParsedMessage> {
    if gmail_msg.id.is_empty() {
        return Err(ParseError {
            message_id: "?".to_string(),
            reason: "missing id".to_string(),
        }
        .into());
    }

    let Some(payload) = gmail_msg.payload.as_ref() else {
        return Err(ParseError {
            message_id: gmail_msg.id.clone(),
            reason: "message has no payload".to_string(),
        }
        .into());
    };

    let internal_date = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    let header = extract_headers(payload, internal_date);
    let body = extract_body(payload);

    Ok(ParsedMessage {
        id: MessageId::new(gmail_msg.id),
        thread_id: ThreadId::new(gmail_msg.thread_id),
        label_ids: gmail_msg.label_ids.unwrap_or_default(),
        header,
        body,
    })
}

/// Extract a header value by name (case-insensitive)
fn extract_header(part: &MessagePart, name: &str) -> Option<String> {
    part.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

fn extract_headers(payload: &MessagePart, internal_date: Option<DateTime<Utc>>) -> EmailHeader {
    let date = extract_header(payload, "Date")
        .and_then(|d| parse_date(&d))
        .or(internal_date)
        .unwrap_or_else(|| {
            log::warn!("[PARSE] Message has no usable date, using epoch");
            epoch()
        });

    let subject = extract_header(payload, "Subject")
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "(no subject)".to_string());

    EmailHeader {
        subject,
        sender: extract_header(payload, "From").unwrap_or_default(),
        to: extract_header(payload, "To").unwrap_or_default(),
        date,
        cc: extract_header(payload, "Cc").unwrap_or_default(),
        message_id_header: extract_header(payload, "Message-ID").unwrap_or_default(),
    }
}

/// Parse an RFC 2822 date, tolerating a trailing zone comment like `(UTC)`
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = match value.find('(') {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    };
    DateTime::parse_from_rfc2822(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn is_mime(part: &MessagePart, prefix: &str) -> bool {
    part.mime_type
        .as_deref()
        .is_some_and(|m| m.to_ascii_lowercase().starts_with(prefix))
}

fn part_data(part: &MessagePart) -> Option<&str> {
    part.body.as_ref()?.data.as_deref().filter(|d| !d.is_empty())
}

/// Find the first text/plain and text/html bodies, skipping attachments
fn walk_parts(part: &MessagePart) -> (Option<String>, Option<String>) {
    if is_mime(part, "text/plain") {
        return (part_data(part).and_then(decode_base64_body), None);
    }
    if is_mime(part, "text/html") {
        return (None, part_data(part).and_then(decode_base64_body));
    }

    let mut plain_text = None;
    let mut html = None;

    if is_mime(part, "multipart/")
        && let Some(parts) = &part.parts
    {
        for sub_part in parts {
            if sub_part.filename.as_deref().is_some_and(|f| !f.is_empty()) {
                continue;
            }
            let (sub_plain, sub_html) = walk_parts(sub_part);
            if plain_text.is_none() {
                plain_text = sub_plain;
            }
            if html.is_none() {
                html = sub_html;
            }
            if plain_text.is_some() && html.is_some() {
                break;
            }
        }
    }

    (plain_text, html)
}

fn extract_body(payload: &MessagePart) -> EmailBody {
    let (mut plain_text, mut html) = walk_parts(payload);

    // Fall back to the top-level body for single-part messages
    if plain_text.is_none()
        && html.is_none()
        && let Some(decoded) = part_data(payload).and_then(decode_base64_body)
    {
        if payload
            .mime_type
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("html"))
        {
            html = Some(decoded);
        } else {
            plain_text = Some(decoded);
        }
    }

    EmailBody { plain_text, html }
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders
        .iter()
        .find_map(|decoder| decoder.decode(data).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
