use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque account identifier handed out by the account store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email_address: String,
    /// Never written to snapshots; hydrated from config or the keychain.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub active: bool,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email_address", &self.email_address)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailFolder {
    #[default]
    Inbox,
    Sent,
}

impl MailFolder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
        }
    }
}

impl fmt::Display for MailFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Cache-assigned id, unique across the whole cache.
    pub id: Uuid,
    pub account_id: AccountId,
    /// RFC 5322 `Message-ID`, when the server provided one.
    pub message_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub folder: MailFolder,
    pub is_read: bool,
    pub is_starred: bool,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// The message-identifier used for deduplication. Empty identifiers count as absent.
    pub fn identifier(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Loose equality used for messages that carry no identifier.
    pub fn resembles(&self, other: &Message, window: chrono::Duration) -> bool {
        self.subject == other.subject
            && self.from == other.from
            && (self.received_at - other.received_at).abs() < window
    }
}

/// Partial in-place update of the user-controlled message flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePatch {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub folder: Option<MailFolder>,
}

impl MessagePatch {
    pub fn apply(&self, message: &mut Message) {
        if let Some(is_read) = self.is_read {
            message.is_read = is_read;
        }
        if let Some(is_starred) = self.is_starred {
            message.is_starred = is_starred;
        }
        if let Some(folder) = self.folder {
            message.folder = folder;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_read.is_none() && self.is_starred.is_none() && self.folder.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMetadata {
    /// `None` until the first batch is ingested.
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncMetadata {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.last_sync {
            Some(last_sync) => now - last_sync > max_age,
            None => true,
        }
    }
}
