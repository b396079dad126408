use crate::CacheError;
use chrono::{DateTime, Utc};
use harbor_core::{Account, AccountId, Message};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Serialized form of the whole cache: three parallel `[account_id, value]` collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub accounts: Vec<(AccountId, Account)>,
    #[serde(default)]
    pub emails: Vec<(AccountId, Vec<Message>)>,
    #[serde(default)]
    pub last_sync: Vec<(AccountId, DateTime<Utc>)>,
}

impl CacheSnapshot {
    pub fn to_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads a snapshot file; a missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(Self::from_json(&content)?))
    }

    /// Writes a sibling `.json.tmp` file, then renames it over `path`.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, self.to_json()?)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    pub fn message_count(&self) -> usize {
        self.emails.iter().map(|(_, messages)| messages.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::MailFolder;
    use uuid::Uuid;

    fn sample() -> CacheSnapshot {
        let id = AccountId::from("acc1");
        CacheSnapshot {
            accounts: Vec::new(),
            emails: vec![(
                id.clone(),
                vec![Message {
                    id: Uuid::new_v4(),
                    account_id: id.clone(),
                    message_id: Some("<m1@example.com>".to_string()),
                    subject: "Hello".to_string(),
                    from: "a@example.com".to_string(),
                    to: "b@example.com".to_string(),
                    cc: None,
                    bcc: None,
                    body_text: "hi".to_string(),
                    body_html: None,
                    attachments: Vec::new(),
                    folder: MailFolder::Inbox,
                    is_read: false,
                    is_starred: false,
                    received_at: Utc::now(),
                }],
            )],
            last_sync: vec![(id, Utc::now())],
        }
    }

    #[test]
    fn collections_serialize_as_id_value_pairs() {
        let json = sample().to_json().expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

        let emails = value["emails"].as_array().expect("emails array");
        assert_eq!(emails[0][0], "acc1");
        assert!(emails[0][1].is_array());
        assert_eq!(value["last_sync"][0][0], "acc1");
    }

    #[test]
    fn missing_collections_default_to_empty() {
        let snapshot = CacheSnapshot::from_json(r#"{"emails": []}"#).expect("parse");
        assert!(snapshot.accounts.is_empty());
        assert!(snapshot.last_sync.is_empty());
    }

    #[test]
    fn malformed_snapshot_is_an_error() {
        assert!(matches!(
            CacheSnapshot::from_json("not json"),
            Err(CacheError::Json(_))
        ));
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = std::env::temp_dir().join(format!("harbor-snapshot-{}", Uuid::new_v4()));
        let path = dir.join("cache.json");

        assert!(CacheSnapshot::load(&path).expect("load missing").is_none());

        sample().save(&path).expect("save snapshot");
        let loaded = CacheSnapshot::load(&path)
            .expect("load snapshot")
            .expect("snapshot present");
        assert_eq!(loaded.message_count(), 1);

        let _ = fs::remove_dir_all(dir);
    }
}
