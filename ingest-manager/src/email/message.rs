//! Message normalization: MIME part trees, encoded bodies, address headers.

use std::collections::BTreeSet;

use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// One page of the upstream message-list endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageListPage {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageRef {
    pub id: String,
}

/// A full message as returned by the upstream get endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawMessage {
    pub id: String,
    /// Epoch milliseconds, as a string on the wire
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
}

/// A node in the nested MIME part tree.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PartBody {
    pub data: Option<String>,
}

/// A normalized email message, decoupled from the wire format.
#[derive(Clone, Debug, PartialEq)]
pub struct EmailMessage {
    pub id: String,
    pub subject: String,
    pub body: String,
    /// Sender address (display name stripped)
    pub sender: String,
    /// To + Cc addresses, flattened
    pub recipients: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Result of one mailbox fetch: normalized messages plus the deduplicated
/// set of every sender and recipient address seen.
#[derive(Clone, Debug, Default)]
pub struct MailboxSnapshot {
    pub messages: Vec<EmailMessage>,
    pub contacts: BTreeSet<String>,
}

/// Normalizes a raw upstream message.
pub(crate) fn normalize_message(raw: &RawMessage) -> EmailMessage {
    let payload = raw.payload.as_ref();

    let subject = payload
        .and_then(|p| header_value(p, "Subject"))
        .unwrap_or_default();
    let sender = payload
        .and_then(|p| header_value(p, "From"))
        .map(|v| parse_address_list(&v))
        .and_then(|addrs| addrs.into_iter().next())
        .unwrap_or_default();

    let mut recipients = Vec::new();
    for header in ["To", "Cc"] {
        if let Some(value) = payload.and_then(|p| header_value(p, header)) {
            recipients.extend(parse_address_list(&value));
        }
    }

    let body = payload.map(extract_body).unwrap_or_default();

    let timestamp = raw
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    EmailMessage {
        id: raw.id.clone(),
        subject,
        body,
        sender,
        recipients,
        timestamp,
    }
}

/// Extracts the message body, preferring a plain-text part, then an HTML
/// part, then whatever the top-level body holds.
fn extract_body(payload: &MessagePart) -> String {
    for mime in ["text/plain", "text/html"] {
        if let Some(data) = find_part_data(payload, mime) {
            return decode_body(data);
        }
    }
    payload
        .body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .map(decode_body)
        .unwrap_or_default()
}

/// Depth-first search for the first part of the given MIME type that
/// actually carries data.
fn find_part_data<'a>(part: &'a MessagePart, mime: &str) -> Option<&'a str> {
    if part.mime_type == mime {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            return Some(data);
        }
    }
    part.parts.iter().find_map(|p| find_part_data(p, mime))
}

/// Decodes a base64url-encoded body (padded or not).
fn decode_body(data: &str) -> String {
    URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn header_value(part: &MessagePart, name: &str) -> Option<String> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Parses a comma-separated address-list header. Entries are either
/// `Name <addr>` or a bare `addr`.
pub(crate) fn parse_address_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let address = match (entry.find('<'), entry.rfind('>')) {
                (Some(open), Some(close)) if open < close => entry[open + 1..close].trim(),
                _ => entry,
            };
            if address.is_empty() {
                None
            } else {
                Some(address.to_string())
            }
        })
        .collect()
}
