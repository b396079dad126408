use crate::SyncService;
use harbor_core::AccountId;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Every n-th tick runs the quiet latest check instead of a refresh.
    pub latest_check_every: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            latest_check_every: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    QuickRefresh,
    LatestCheck,
}

impl PollMode {
    /// Ticks are counted from 1.
    pub fn for_tick(tick: u64, latest_check_every: u64) -> Self {
        if latest_check_every > 0 && tick % latest_check_every == 0 {
            Self::LatestCheck
        } else {
            Self::QuickRefresh
        }
    }
}

/// Background polling for the currently selected account. At most one task runs; selecting
/// another account aborts the previous one.
pub struct PollScheduler {
    service: SyncService,
    settings: PollSettings,
    current: Mutex<Option<(AccountId, JoinHandle<()>)>>,
}

impl PollScheduler {
    pub fn new(service: SyncService, settings: PollSettings) -> Self {
        Self {
            service,
            settings,
            current: Mutex::new(None),
        }
    }

    pub async fn select(&self, account_id: AccountId) {
        let mut current = self.current.lock().await;
        if let Some((previous, handle)) = current.take() {
            handle.abort();
            tracing::debug!(account = %previous, "stopped background polling");
        }

        let handle = tokio::spawn(poll_loop(
            self.service.clone(),
            account_id.clone(),
            self.settings,
        ));
        tracing::info!(
            account = %account_id,
            interval_secs = self.settings.interval.as_secs(),
            "started background polling"
        );
        *current = Some((account_id, handle));
    }

    pub async fn stop(&self) {
        if let Some((account_id, handle)) = self.current.lock().await.take() {
            handle.abort();
            tracing::info!(account = %account_id, "stopped background polling");
        }
    }

    pub async fn selected(&self) -> Option<AccountId> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|(account_id, _)| account_id.clone())
    }
}

async fn poll_loop(service: SyncService, account_id: AccountId, settings: PollSettings) {
    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick += 1;

        let mode = PollMode::for_tick(tick, settings.latest_check_every);
        let result = match mode {
            PollMode::QuickRefresh => service.refresh(&account_id).await,
            PollMode::LatestCheck => service.check_latest(&account_id).await,
        };

        match result {
            Ok(outcome) if outcome.new_count > 0 => {
                tracing::info!(account = %account_id, ?mode, new = outcome.new_count, "background poll found mail");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(account = %account_id, ?mode, error = %err, "background poll failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::service_with;
    use std::sync::atomic::Ordering;

    #[test]
    fn every_third_tick_is_a_latest_check() {
        let modes = (1..=6)
            .map(|tick| PollMode::for_tick(tick, 3))
            .collect::<Vec<_>>();
        assert_eq!(
            modes,
            vec![
                PollMode::QuickRefresh,
                PollMode::QuickRefresh,
                PollMode::LatestCheck,
                PollMode::QuickRefresh,
                PollMode::QuickRefresh,
                PollMode::LatestCheck,
            ]
        );
        assert_eq!(PollMode::for_tick(3, 0), PollMode::QuickRefresh);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_each_interval() {
        let (service, backend) = service_with(&["acc1"]).await;
        let scheduler = PollScheduler::new(service, PollSettings::default());

        scheduler.select(AccountId::from("acc1")).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_another_account_replaces_the_task() {
        let (service, backend) = service_with(&["acc1", "acc2"]).await;
        let scheduler = PollScheduler::new(service, PollSettings::default());

        scheduler.select(AccountId::from("acc1")).await;
        scheduler.select(AccountId::from("acc2")).await;
        assert_eq!(scheduler.selected().await, Some(AccountId::from("acc2")));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        assert_eq!(scheduler.selected().await, None);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);
    }
}
