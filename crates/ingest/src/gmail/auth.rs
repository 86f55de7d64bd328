//! OAuth2 for a desktop Gmail client
//!
//! First use opens the consent page in a browser and catches the redirect on
//! a one-shot loopback listener. The resulting tokens are cached as JSON at
//! the configured path and renewed with the refresh token when close to
//! expiry.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::GmailCredentials;
use crate::error::AuthError;

const CONSENT_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Loopback ports tried in order for the redirect listener
const LOOPBACK_PORTS: std::ops::RangeInclusive<u16> = 8080..=8090;

/// Seconds before expiry at which a cached token is renewed
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Token endpoint reply, for both code exchange and refresh
#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// On-disk token cache entry
#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix seconds
    expires_at: Option<i64>,
}

impl CachedToken {
    fn from_grant(grant: GrantResponse, previous_refresh: Option<&str>) -> Self {
        Self {
            access_token: grant.access_token,
            // Google omits the refresh token when refreshing
            refresh_token: grant
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: grant
                .expires_in
                .map(|secs| Utc::now().timestamp() + secs as i64),
        }
    }

    fn is_fresh(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at > Utc::now().timestamp() + EXPIRY_MARGIN_SECS)
    }
}

/// Gmail OAuth client with a file-backed token cache
pub struct GmailAuth {
    client_id: String,
    client_secret: String,
    token_path: PathBuf,
}

impl GmailAuth {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_path: token_path.as_ref().to_path_buf(),
        }
    }

    /// Build from an OAuth client secrets file downloaded from Google Cloud Console
    pub fn from_credentials_file(
        credentials_path: impl AsRef<Path>,
        token_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = credentials_path.as_ref();
        let creds = GmailCredentials::from_file(path)
            .map_err(|e| AuthError(format!("Credentials file {} is unusable: {e:#}", path.display())))?;
        Ok(Self::new(creds.client_id, creds.client_secret, token_path))
    }

    /// A usable access token: cached, refreshed, or freshly authorized
    pub fn get_access_token(&self) -> Result<String> {
        let cached = self.read_cache().ok();

        if let Some(token) = &cached {
            if token.is_fresh() {
                return Ok(token.access_token.clone());
            }
            if let Some(refresh) = token.refresh_token.as_deref() {
                match self.request_grant(&[("grant_type", "refresh_token"), ("refresh_token", refresh)]) {
                    Ok(grant) => {
                        log::info!("[GMAIL] Refreshed access token");
                        return self.store(CachedToken::from_grant(grant, Some(refresh)));
                    }
                    Err(e) => log::warn!("[GMAIL] Token refresh failed, re-authorizing: {e:#}"),
                }
            }
        }

        let grant = self.authorize_interactively()?;
        self.store(CachedToken::from_grant(grant, None))
    }

    fn consent_url(&self, redirect_uri: &str) -> Result<Url> {
        Url::parse_with_params(
            CONSENT_ENDPOINT,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", READONLY_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .context("Failed to build consent URL")
    }

    fn authorize_interactively(&self) -> Result<GrantResponse> {
        let (listener, port) = bind_loopback()?;
        let redirect_uri = format!("http://localhost:{}", port);
        let consent = self.consent_url(&redirect_uri)?;

        eprintln!("\nGmail authorization required.");
        eprintln!("If no browser window opens, visit:\n{}\n", consent);
        if let Err(e) = open::that(consent.as_str()) {
            log::warn!("[GMAIL] Could not open browser: {}", e);
        }

        log::info!("[GMAIL] Waiting for authorization redirect on port {}", port);
        let (stream, _) = listener
            .accept()
            .context("Failed to accept authorization redirect")?;
        let code = answer_redirect(stream)?;

        let grant = self
            .request_grant(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .map_err(|e| AuthError(format!("Code exchange failed: {e:#}")))?;
        log::info!("[GMAIL] Authorization complete");
        Ok(grant)
    }

    /// POST to the token endpoint with client credentials plus `grant`
    fn request_grant(&self, grant: &[(&str, &str)]) -> Result<GrantResponse> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        form.extend_from_slice(grant);

        let mut response = ureq::post(TOKEN_ENDPOINT)
            .send_form(form)
            .context("Token endpoint request failed")?;
        response
            .body_mut()
            .read_json()
            .context("Unexpected token endpoint response")
    }

    fn read_cache(&self) -> Result<CachedToken> {
        config::load_json_file(&self.token_path)
    }

    /// Persist `token` and hand back its access token
    fn store(&self, token: CachedToken) -> Result<String> {
        config::save_json_file(&self.token_path, &token)?;
        Ok(token.access_token)
    }
}

fn bind_loopback() -> Result<(TcpListener, u16)> {
    LOOPBACK_PORTS
        .clone()
        .find_map(|port| {
            TcpListener::bind(("127.0.0.1", port))
                .ok()
                .map(|l| (l, port))
        })
        .ok_or_else(|| {
            AuthError(format!(
                "No free loopback port in {}-{}",
                LOOPBACK_PORTS.start(),
                LOOPBACK_PORTS.end()
            ))
            .into()
        })
}

/// Read the redirect request, reply to the browser and return the code
fn answer_redirect(mut stream: TcpStream) -> Result<String> {
    let mut request_line = String::new();
    BufReader::new(&stream)
        .read_line(&mut request_line)
        .context("Failed to read authorization redirect")?;

    // GET /?code=...&scope=... HTTP/1.1
    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let outcome = code_from_redirect(target);

    let (status, message) = if outcome.is_ok() {
        ("200 OK", "Authorization complete. This window can be closed.")
    } else {
        ("400 Bad Request", "Authorization failed. Check the terminal.")
    };
    let reply = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{message}\n"
    );
    stream.write_all(reply.as_bytes()).ok();

    outcome
}

/// Pull the authorization code (or the provider's error) out of a redirect target
fn code_from_redirect(target: &str) -> Result<String> {
    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(target))
        .context("Malformed authorization redirect")?;

    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "error" => return Err(AuthError(format!("Consent denied: {}", value)).into()),
            "code" => code = Some(value.into_owned()),
            _ => {}
        }
    }

    code.ok_or_else(|| AuthError("Redirect carried no authorization code".to_string()).into())
}
