use crate::ConfigError;
use harbor_core::{Account, AccountId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;

const MAX_INTERVAL_SECS: u64 = 30 * 86_400;
const MAX_TIMEOUT_SECS: u64 = 3_600;
const MAX_WINDOW_DAYS: i64 = 365;
const MAX_RETENTION_DAYS: i64 = 3_650;
const MAX_POLICY_MINUTES: i64 = 7 * 24 * 60;
const MAX_SIMILARITY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: u32,
    pub selected_account: Option<String>,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
    pub policy: PolicyConfig,
    pub storage: StorageConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    pub latest_check_every: u64,
    pub stale_after_secs: u64,
    pub cleanup_interval_secs: u64,
    pub cleanup_max_age_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub unread_window_days: i64,
    pub read_window_days: i64,
    pub max_messages: usize,
    pub connect_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub inbox_folder: String,
    pub sent_folder: String,
}

/// Receive-time windows applied to fetched batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub quick_check_minutes: i64,
    pub latest_minutes: i64,
    pub latest_fallback_minutes: i64,
    pub similarity_window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub persist_snapshot: bool,
    /// Relative paths resolve against the data directory.
    pub snapshot_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub email: String,
    /// Looked up in the OS keychain when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    465
}

fn default_active() -> bool {
    true
}

impl AccountConfig {
    pub fn to_account(&self) -> Account {
        Account {
            id: AccountId::new(self.id.clone()),
            email_address: self.email.clone(),
            password: self.password.clone(),
            imap_host: self.imap_host.clone(),
            imap_port: self.imap_port,
            smtp_host: self.smtp_host.clone(),
            smtp_port: self.smtp_port,
            active: self.active,
        }
    }
}

impl AppConfig {
    /// The configured selection when it names a known account, otherwise the first active one.
    pub fn initial_selection(&self) -> Option<AccountId> {
        let selected = self
            .selected_account
            .as_deref()
            .filter(|id| self.accounts.iter().any(|account| account.id == *id));

        selected
            .or_else(|| {
                self.accounts
                    .iter()
                    .find(|account| account.active)
                    .map(|account| account.id.as_str())
            })
            .map(AccountId::from)
    }

    /// Rejects values that would yield empty, negative or unrepresentable durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        in_range("sync.poll_interval_secs", sync.poll_interval_secs, 1, MAX_INTERVAL_SECS)?;
        in_range("sync.latest_check_every", sync.latest_check_every, 1, 1_000)?;
        in_range("sync.stale_after_secs", sync.stale_after_secs, 1, MAX_INTERVAL_SECS)?;
        in_range("sync.cleanup_interval_secs", sync.cleanup_interval_secs, 1, MAX_INTERVAL_SECS)?;
        in_range("sync.cleanup_max_age_days", sync.cleanup_max_age_days, 1, MAX_RETENTION_DAYS)?;

        let fetch = &self.fetch;
        in_range("fetch.unread_window_days", fetch.unread_window_days, 1, MAX_WINDOW_DAYS)?;
        in_range("fetch.read_window_days", fetch.read_window_days, 1, MAX_WINDOW_DAYS)?;
        in_range("fetch.max_messages", fetch.max_messages, 1, 10_000)?;
        for (field, secs) in [
            ("fetch.connect_timeout_secs", fetch.connect_timeout_secs),
            ("fetch.probe_timeout_secs", fetch.probe_timeout_secs),
            ("fetch.fetch_timeout_secs", fetch.fetch_timeout_secs),
            ("fetch.send_timeout_secs", fetch.send_timeout_secs),
        ] {
            in_range(field, secs, 1, MAX_TIMEOUT_SECS)?;
        }
        if fetch.inbox_folder.trim().is_empty() || fetch.sent_folder.trim().is_empty() {
            return Err(ConfigError::Invalid("folder names must not be empty".to_string()));
        }

        let policy = &self.policy;
        in_range("policy.quick_check_minutes", policy.quick_check_minutes, 1, MAX_POLICY_MINUTES)?;
        in_range("policy.latest_minutes", policy.latest_minutes, 1, MAX_POLICY_MINUTES)?;
        in_range(
            "policy.latest_fallback_minutes",
            policy.latest_fallback_minutes,
            policy.latest_minutes,
            MAX_POLICY_MINUTES,
        )?;
        in_range(
            "policy.similarity_window_secs",
            policy.similarity_window_secs,
            1,
            MAX_SIMILARITY_SECS,
        )?;

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(ConfigError::Invalid("account id must not be empty".to_string()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account id `{}`",
                    account.id
                )));
            }
        }

        Ok(())
    }
}

fn in_range<T>(field: &str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + Display,
{
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{field} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            latest_check_every: 3,
            stale_after_secs: 300,
            cleanup_interval_secs: 3600,
            cleanup_max_age_days: 7,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            unread_window_days: 7,
            read_window_days: 1,
            max_messages: 100,
            connect_timeout_secs: 15,
            probe_timeout_secs: 10,
            fetch_timeout_secs: 60,
            send_timeout_secs: 30,
            inbox_folder: "INBOX".to_string(),
            sent_folder: "Sent".to_string(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            quick_check_minutes: 5,
            latest_minutes: 30,
            latest_fallback_minutes: 60,
            similarity_window_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persist_snapshot: true,
            snapshot_file: "cache.json".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            selected_account: None,
            sync: SyncConfig::default(),
            fetch: FetchConfig::default(),
            policy: PolicyConfig::default(),
            storage: StorageConfig::default(),
            accounts: Vec::new(),
        }
    }
}
