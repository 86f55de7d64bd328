//! Settings and OAuth credential loading
//!
//! Settings are resolved in layers:
//! 1. Built-in defaults
//! 2. JSON file (`~/.config/gmail-ingestor/settings.json` or an explicit path)
//! 3. `GMAIL_*` environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::LabelId;

/// Settings filename in the ingestor config directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "GMAIL_";

/// Runtime configuration for the ingestor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestorSettings {
    /// Google Cloud Console OAuth client file
    pub credentials_path: PathBuf,
    /// Cached OAuth token
    pub token_path: PathBuf,

    /// Label ingested when none is given on the command line
    pub label: String,
    /// Page size for message discovery (Gmail caps this at 500)
    pub max_results_per_page: usize,
    /// Messages per fetch/convert batch
    pub batch_size: usize,

    pub output_markdown_dir: PathBuf,
    pub output_raw_dir: PathBuf,
    pub database_path: PathBuf,

    pub max_retries: u32,
    pub initial_backoff_seconds: f64,
    pub max_backoff_seconds: f64,
    pub inter_page_delay_seconds: f64,

    pub log_level: String,
}

impl Default for IngestorSettings {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("credentials/client_secret.json"),
            token_path: PathBuf::from("credentials/token.json"),
            label: LabelId::INBOX.to_string(),
            max_results_per_page: 100,
            batch_size: 50,
            output_markdown_dir: PathBuf::from("output/markdown"),
            output_raw_dir: PathBuf::from("output/raw"),
            database_path: PathBuf::from("data/gmail_ingestor.db"),
            max_retries: 5,
            initial_backoff_seconds: 1.0,
            max_backoff_seconds: 60.0,
            inter_page_delay_seconds: 0.2,
            log_level: "info".to_string(),
        }
    }
}

impl IngestorSettings {
    /// Load settings from the default config file (if present) and the environment
    pub fn load() -> Result<Self> {
        let base = config::load_json_if_exists::<Self>(SETTINGS_FILE)?.unwrap_or_default();
        base.with_env_overrides()
    }

    /// Load settings from a specific JSON file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let base: Self = config::load_json_file(path)?;
        base.with_env_overrides()
    }

    /// Apply `GMAIL_*` environment variable overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Apply overrides from an arbitrary lookup (keys are upper-case field names)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CREDENTIALS_PATH") {
            self.credentials_path = v.into();
        }
        if let Some(v) = lookup("TOKEN_PATH") {
            self.token_path = v.into();
        }
        if let Some(v) = lookup("LABEL") {
            self.label = v;
        }
        if let Some(v) = lookup("MAX_RESULTS_PER_PAGE") {
            self.max_results_per_page = parse_env("MAX_RESULTS_PER_PAGE", &v)?;
        }
        if let Some(v) = lookup("BATCH_SIZE") {
            self.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("OUTPUT_MARKDOWN_DIR") {
            self.output_markdown_dir = v.into();
        }
        if let Some(v) = lookup("OUTPUT_RAW_DIR") {
            self.output_raw_dir = v.into();
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.database_path = v.into();
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("INITIAL_BACKOFF_SECONDS") {
            self.initial_backoff_seconds = parse_env("INITIAL_BACKOFF_SECONDS", &v)?;
        }
        if let Some(v) = lookup("MAX_BACKOFF_SECONDS") {
            self.max_backoff_seconds = parse_env("MAX_BACKOFF_SECONDS", &v)?;
        }
        if let Some(v) = lookup("INTER_PAGE_DELAY_SECONDS") {
            self.inter_page_delay_seconds = parse_env("INTER_PAGE_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(
            self.max_results_per_page > 0,
            "max_results_per_page must be positive"
        );
        anyhow::ensure!(
            self.initial_backoff_seconds >= 0.0 && self.max_backoff_seconds >= 0.0,
            "backoff durations must be non-negative"
        );
        Ok(())
    }

    /// Create output, data and credentials directories
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            Some(self.output_markdown_dir.as_path()),
            Some(self.output_raw_dir.as_path()),
            self.database_path.parent(),
            self.credentials_path.parent(),
        ]
        .into_iter()
        .flatten()
        .filter(|d| !d.as_os_str().is_empty())
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.initial_backoff_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.max_backoff_seconds)
    }

    pub fn inter_page_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_page_delay_seconds.max(0.0))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {ENV_PREFIX}{key}={value:?}: {e}"))
}

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials from a Google Cloud Console JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)
            .with_context(|| format!("Could not load OAuth client from {}", path.display()))?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Desktop ("installed") and "web" clients are both accepted
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = IngestorSettings::default();
        assert_eq!(settings.label, "INBOX");
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.max_results_per_page, 100);
        assert_eq!(settings.database_path, PathBuf::from("data/gmail_ingestor.db"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LABEL", "Label_7"),
            ("BATCH_SIZE", "10"),
            ("DATABASE_PATH", "/tmp/x.db"),
        ]);
        let settings = IngestorSettings::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.label, "Label_7");
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(settings.max_results_per_page, 100);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let result = IngestorSettings::default().with_overrides(|k| {
            (k == "BATCH_SIZE").then(|| "many".to_string())
        });
        assert!(result.is_err());

        let result = IngestorSettings::default()
            .with_overrides(|k| (k == "BATCH_SIZE").then(|| "0".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: IngestorSettings =
            serde_json::from_str(r#"{ "label": "SENT", "batch_size": 5 }"#).unwrap();
        assert_eq!(settings.label, "SENT");
        assert_eq!(settings.batch_size, 5);
        assert_eq!(settings.output_raw_dir, PathBuf::from("output/raw"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let settings = IngestorSettings {
            output_markdown_dir: dir.path().join("md"),
            output_raw_dir: dir.path().join("raw"),
            database_path: dir.path().join("data").join("t.db"),
            credentials_path: dir.path().join("creds").join("c.json"),
            ..IngestorSettings::default()
        };
        settings.ensure_directories().unwrap();
        assert!(dir.path().join("md").is_dir());
        assert!(dir.path().join("raw").is_dir());
        assert!(dir.path().join("data").is_dir());
        assert!(dir.path().join("creds").is_dir());
    }

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_invalid_credentials_json() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }
}
