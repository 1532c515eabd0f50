//! Email provider integration (Gmail).
//!
//! Covers the full credential lifecycle — authorization URL, code exchange,
//! proactive token refresh — plus the resilient paginated mailbox fetch and
//! normalization of raw messages into [`EmailMessage`] records.

mod client;
mod message;

pub use client::GmailClient;
pub use message::{EmailMessage, MailboxSnapshot};

pub(crate) const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub(crate) const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub(crate) const API_BASE: &str = "https://gmail.googleapis.com";

/// Read-only mailbox scope
pub(crate) const SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
