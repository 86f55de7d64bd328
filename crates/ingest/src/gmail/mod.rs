//! Gmail API integration
//!
//! OAuth, the REST client used for discovery and fetch, and MIME parsing
//! into [`ParsedMessage`](crate::models::ParsedMessage).

pub mod api;
mod auth;
mod client;
mod parse;

pub use auth::GmailAuth;
pub use client::{DiscoveryPages, GmailClient, RetryPolicy};
pub use parse::parse_message;
