//! Gmail API HTTP client
//!
//! Uses synchronous HTTP (ureq). Requests rejected with HTTP 429 are retried
//! with capped exponential backoff plus jitter; once the retry budget is spent
//! the call fails with [`RateLimitError`].

use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use super::GmailAuth;
use super::api::{GmailMessage, ListLabelsResponse, ListMessagesResponse};
use super::parse::parse_message;
use crate::config::IngestorSettings;
use crate::error::RateLimitError;
use crate::models::{Label, MessageId, MessageStub};
use crate::pipeline::{BatchResult, DiscoverySource, FetchSource, StubPages};

/// Gmail rejects page sizes above this
const MAX_PAGE_SIZE: usize = 500;

/// Backoff schedule for rate-limited requests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &IngestorSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Gmail API client
pub struct GmailClient {
    auth: GmailAuth,
    retry: RetryPolicy,
    inter_page_delay: Duration,
}

impl GmailClient {
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1/users/me";

    pub fn new(auth: GmailAuth) -> Self {
        Self {
            auth,
            retry: RetryPolicy::default(),
            inter_page_delay: Duration::ZERO,
        }
    }

    /// Build a client from settings: credentials file, token cache and retry knobs
    pub fn from_settings(settings: &IngestorSettings) -> Result<Self> {
        let auth = GmailAuth::from_credentials_file(&settings.credentials_path, &settings.token_path)?;
        Ok(Self::new(auth)
            .with_retry_policy(RetryPolicy::from_settings(settings))
            .with_inter_page_delay(settings.inter_page_delay()))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_inter_page_delay(mut self, delay: Duration) -> Self {
        self.inter_page_delay = delay;
        self
    }

    /// Trigger the OAuth flow now rather than on the first request
    pub fn authenticate(&self) -> Result<()> {
        self.auth.get_access_token()?;
        Ok(())
    }

    /// GET a JSON resource, retrying on 429
    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let access_token = self.auth.get_access_token()?;
        let bearer = format!("Bearer {}", access_token);

        let mut response = with_rate_limit_retry(&self.retry, what, || {
            ureq::get(url).header("Authorization", &bearer).call()
        })?;

        response
            .body_mut()
            .read_json()
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// List all labels in the user's mailbox
    pub fn list_labels_raw(&self) -> Result<ListLabelsResponse> {
        let url = format!("{}/labels", Self::BASE_URL);
        self.get_json(&url, "list labels")
    }

    /// List one page of message references
    pub fn list_messages(
        &self,
        label: &str,
        query: Option<&str>,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let url = messages_url(label, query, max_results, page_token)?;
        self.get_json(url.as_str(), "list messages")
    }

    /// Get full message details by ID
    pub fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        let url = format!("{}/messages/{}?format=full", Self::BASE_URL, id.as_str());
        self.get_json(&url, "get message")
    }
}

fn messages_url(
    label: &str,
    query: Option<&str>,
    max_results: usize,
    page_token: Option<&str>,
) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/messages", GmailClient::BASE_URL))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("labelIds", label)
            .append_pair("maxResults", &max_results.clamp(1, MAX_PAGE_SIZE).to_string());
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            pairs.append_pair("q", q);
        }
        if let Some(token) = page_token {
            pairs.append_pair("pageToken", token);
        }
    }
    Ok(url)
}

/// Run `request`, sleeping and retrying while it fails with HTTP 429
fn with_rate_limit_retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut request: impl FnMut() -> Result<T, ureq::Error>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match request() {
            Ok(value) => return Ok(value),
            Err(ureq::Error::StatusCode(429)) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt) + Duration::from_millis(rand_jitter());
                log::warn!(
                    "[GMAIL] Rate limited on {}, retry {}/{} in {:?}",
                    what,
                    attempt + 1,
                    policy.max_retries,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(ureq::Error::StatusCode(429)) => {
                return Err(RateLimitError {
                    context: what.to_string(),
                    retries: policy.max_retries,
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Failed to {}", what))),
        }
    }
}

/// Generate a random jitter value (0-1000ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 1000
}

/// Lazy page iterator over `messages.list`
///
/// Stops after a page without a continuation token, on an empty page, or
/// after yielding an error.
pub struct DiscoveryPages<F> {
    fetch_page: F,
    page_token: Option<String>,
    inter_page_delay: Duration,
    pages_yielded: usize,
    done: bool,
}

impl<F> DiscoveryPages<F>
where
    F: FnMut(Option<&str>) -> Result<ListMessagesResponse>,
{
    pub fn new(fetch_page: F, inter_page_delay: Duration) -> Self {
        Self {
            fetch_page,
            page_token: None,
            inter_page_delay,
            pages_yielded: 0,
            done: false,
        }
    }
}

impl<F> Iterator for DiscoveryPages<F>
where
    F: FnMut(Option<&str>) -> Result<ListMessagesResponse>,
{
    type Item = Result<Vec<MessageStub>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.pages_yielded > 0 && !self.inter_page_delay.is_zero() {
            std::thread::sleep(self.inter_page_delay);
        }

        let response = match (self.fetch_page)(self.page_token.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let stubs: Vec<MessageStub> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| MessageStub::new(m.id, m.thread_id))
            .collect();

        if stubs.is_empty() {
            self.done = true;
            return None;
        }

        self.page_token = response.next_page_token;
        if self.page_token.is_none() {
            self.done = true;
        }
        self.pages_yielded += 1;
        Some(Ok(stubs))
    }
}

impl DiscoverySource for GmailClient {
    fn list_labels(&self) -> Result<Vec<Label>> {
        let labels = self
            .list_labels_raw()?
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| Label::new(l.id, l.name))
            .collect();
        Ok(labels)
    }

    fn discover_message_ids<'a>(
        &'a self,
        label: &str,
        query: Option<&str>,
        page_size: usize,
    ) -> StubPages<'a> {
        let label = label.to_string();
        let query = query.map(str::to_string);
        let fetch_page = move |token: Option<&str>| -> Result<ListMessagesResponse> {
            let page = self.list_messages(&label, query.as_deref(), page_size, token)?;
            log::debug!(
                "[GMAIL] Listed page: {} refs (estimate {:?})",
                page.messages.as_ref().map_or(0, Vec::len),
                page.result_size_estimate
            );
            Ok(page)
        };
        Box::new(DiscoveryPages::new(fetch_page, self.inter_page_delay))
    }
}

impl FetchSource for GmailClient {
    fn fetch_messages_batch(&self, ids: &[MessageId]) -> Result<BatchResult> {
        let mut results = Vec::with_capacity(ids.len());

        for id in ids {
            match self.get_message(id) {
                Ok(raw) => results.push((id.clone(), parse_message(raw))),
                // A throttled batch is abandoned as a whole
                Err(e) if crate::error::is_rate_limited(&e) => return Err(e),
                Err(e) => results.push((id.clone(), Err(e))),
            }
        }

        Ok(results)
    }
}
