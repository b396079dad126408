use anyhow::{anyhow, Context};
use chrono::TimeDelta;
use harbor_cache::{AccountCache, CacheSnapshot};
use harbor_config::{AppConfig, ConfigManager, FetchConfig, PolicyConfig, SyncConfig};
use harbor_core::{Account, AccountId};
use harbor_email::{
    BackendSettings, FetchWindows, ImapSmtpBackend, MailBackend, PollScheduler, PollSettings,
    SearchPlan, SyncService,
};
use harbor_security::SecretStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const KEYCHAIN_SERVICE: &str = "io.harbor.daemon";

pub struct DaemonState {
    pub(crate) config: AppConfig,
    pub(crate) snapshot_path: Option<PathBuf>,
    stale_after: TimeDelta,
    cleanup_max_age: TimeDelta,
    pub(crate) sync: SyncService,
    pub(crate) scheduler: PollScheduler,
}

impl DaemonState {
    pub async fn initialize() -> anyhow::Result<Self> {
        let config_manager = ConfigManager::new().context("initialize config manager")?;
        let config = config_manager.load().with_context(|| {
            format!("load app config from {}", config_manager.config_path().display())
        })?;
        tracing::info!(
            path = %config_manager.config_path().display(),
            accounts = config.accounts.len(),
            "config loaded"
        );

        let secrets = SecretStore::new(KEYCHAIN_SERVICE);
        let mut accounts = Vec::with_capacity(config.accounts.len());
        for entry in &config.accounts {
            let mut account = entry.to_account();
            secrets
                .hydrate_password(&mut account)
                .with_context(|| format!("load password for account {}", account.id))?;
            accounts.push(account);
        }

        let snapshot_path = config
            .storage
            .persist_snapshot
            .then(|| config_manager.snapshot_path(&config.storage));
        let backend = Arc::new(ImapSmtpBackend::new(backend_settings(&config.fetch)));

        Self::assemble(config, accounts, snapshot_path, backend).await
    }

    pub(crate) async fn assemble(
        config: AppConfig,
        accounts: Vec<Account>,
        snapshot_path: Option<PathBuf>,
        backend: Arc<dyn MailBackend>,
    ) -> anyhow::Result<Self> {
        config.validate().context("validate app config")?;
        let windows = fetch_windows(&config.policy)?;
        let stale_after = span("sync.stale_after_secs", seconds(config.sync.stale_after_secs))?;
        let cleanup_max_age = span(
            "sync.cleanup_max_age_days",
            TimeDelta::try_days(config.sync.cleanup_max_age_days),
        )?;

        let cache = Arc::new(AccountCache::new());

        if let Some(path) = &snapshot_path {
            match CacheSnapshot::load(path) {
                Ok(Some(snapshot)) => {
                    let messages = snapshot.message_count();
                    cache.import(snapshot).await;
                    tracing::info!(path = %path.display(), messages, "restored cache snapshot");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable cache snapshot");
                }
            }
        }

        // Config is authoritative for the account set; snapshots never carry passwords.
        let configured = accounts
            .iter()
            .map(|account| account.id.clone())
            .collect::<HashSet<AccountId>>();
        for restored in cache.accounts().await {
            if !configured.contains(&restored.id) && cache.remove_account(&restored.id).await {
                tracing::info!(account = %restored.id, "dropped cached account missing from config");
            }
        }
        for account in accounts {
            cache.upsert_account(account).await;
        }

        let sync = SyncService::new(cache, backend, windows);
        let scheduler = PollScheduler::new(sync.clone(), poll_settings(&config.sync));

        Ok(Self {
            config,
            snapshot_path,
            stale_after,
            cleanup_max_age,
            sync,
            scheduler,
        })
    }

    /// Refreshes active accounts whose last sync is missing or older than `stale_after_secs`.
    pub async fn refresh_stale(&self) -> usize {
        let cache = self.sync.cache();

        let mut stale = Vec::new();
        for account in cache.accounts().await {
            if account.active && cache.is_sync_stale(&account.id, self.stale_after).await {
                stale.push(account);
            }
        }
        if stale.is_empty() {
            return 0;
        }

        let summary = self.sync.refresh_all(&stale).await;
        summary.success_count
    }

    pub async fn start_polling(&self) {
        match self.config.initial_selection() {
            Some(account_id) => self.scheduler.select(account_id).await,
            None => tracing::info!("no account selected; background polling idle"),
        }
    }

    pub async fn cleanup(&self) -> usize {
        let removed = self.sync.cache().cleanup(self.cleanup_max_age).await;
        if removed > 0 {
            tracing::info!(removed, "dropped aged messages from cache");
        }
        removed
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };

        let snapshot = self.sync.cache().export().await;
        let messages = snapshot.message_count();
        tokio::task::spawn_blocking(move || snapshot.save(&path))
            .await
            .context("join snapshot writer")?
            .context("write cache snapshot")?;
        tracing::debug!(messages, "cache snapshot saved");
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.stop().await;
        self.persist().await
    }
}

pub(crate) fn backend_settings(fetch: &FetchConfig) -> BackendSettings {
    BackendSettings {
        connect_timeout: Duration::from_secs(fetch.connect_timeout_secs),
        probe_timeout: Duration::from_secs(fetch.probe_timeout_secs),
        fetch_timeout: Duration::from_secs(fetch.fetch_timeout_secs),
        send_timeout: Duration::from_secs(fetch.send_timeout_secs),
        search: SearchPlan {
            unread_days: fetch.unread_window_days,
            read_days: fetch.read_window_days,
            limit: fetch.max_messages,
        },
        inbox_folder: fetch.inbox_folder.clone(),
        sent_folder: fetch.sent_folder.clone(),
    }
}

pub(crate) fn fetch_windows(policy: &PolicyConfig) -> anyhow::Result<FetchWindows> {
    Ok(FetchWindows {
        quick_check: span(
            "policy.quick_check_minutes",
            TimeDelta::try_minutes(policy.quick_check_minutes),
        )?,
        latest: span("policy.latest_minutes", TimeDelta::try_minutes(policy.latest_minutes))?,
        latest_fallback: span(
            "policy.latest_fallback_minutes",
            TimeDelta::try_minutes(policy.latest_fallback_minutes),
        )?,
        similarity: span(
            "policy.similarity_window_secs",
            TimeDelta::try_seconds(policy.similarity_window_secs),
        )?,
    })
}

fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

/// Accepts only strictly positive, representable spans.
fn span(field: &str, value: Option<TimeDelta>) -> anyhow::Result<TimeDelta> {
    value
        .filter(|span| *span > TimeDelta::zero())
        .ok_or_else(|| anyhow!("{field} is out of range"))
}

pub(crate) fn poll_settings(sync: &SyncConfig) -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(sync.poll_interval_secs.max(1)),
        latest_check_every: sync.latest_check_every,
    }
}
