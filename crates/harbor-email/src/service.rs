use crate::{parse_batch, EmailError, FetchTrigger, FetchWindows, MailBackend, OutgoingMail};
use chrono::Utc;
use harbor_cache::AccountCache;
use harbor_core::{Account, AccountId, MailFolder, Message, MessagePatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Result of one sync operation against a single account.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub message: String,
    /// Number of entries in `emails`.
    pub count: usize,
    pub new_count: usize,
    /// Messages cached for the account after the operation.
    pub total: usize,
    pub emails: Vec<Message>,
    pub source: &'static str,
    pub window_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountRefresh {
    pub account_id: AccountId,
    pub email_address: String,
    pub success: bool,
    pub new_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshAllSummary {
    pub total_accounts: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_new: usize,
    pub results: Vec<AccountRefresh>,
}

/// A message authored locally, stored without going through the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalMessage {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub body: String,
    pub body_html: Option<String>,
    pub folder: Option<MailFolder>,
}

#[derive(Clone)]
pub struct SyncService {
    cache: Arc<AccountCache>,
    backend: Arc<dyn MailBackend>,
    windows: FetchWindows,
}

impl SyncService {
    pub fn new(cache: Arc<AccountCache>, backend: Arc<dyn MailBackend>, windows: FetchWindows) -> Self {
        Self {
            cache,
            backend,
            windows,
        }
    }

    pub fn cache(&self) -> &Arc<AccountCache> {
        &self.cache
    }

    /// Probes the servers before storing the account.
    pub async fn register_account(&self, account: Account) -> Result<(), EmailError> {
        if !self.backend.test_connection(&account).await {
            return Err(EmailError::Connection(format!(
                "could not connect to {} as {}",
                account.imap_host, account.email_address
            )));
        }

        tracing::info!(account = %account.id, email = %account.email_address, "account registered");
        self.cache.upsert_account(account).await;
        Ok(())
    }

    pub async fn remove_account(&self, account_id: &AccountId) -> Result<(), EmailError> {
        if self.cache.remove_account(account_id).await {
            Ok(())
        } else {
            Err(not_found_account(account_id))
        }
    }

    pub async fn refresh(&self, account_id: &AccountId) -> Result<SyncOutcome, EmailError> {
        self.run(account_id, FetchTrigger::Refresh).await
    }

    pub async fn fetch_all(&self, account_id: &AccountId) -> Result<SyncOutcome, EmailError> {
        self.run(account_id, FetchTrigger::FetchAll).await
    }

    /// Same merge as [`SyncService::fetch_all`]; cached messages the server no longer
    /// reports are kept.
    pub async fn force_refresh(&self, account_id: &AccountId) -> Result<SyncOutcome, EmailError> {
        self.run(account_id, FetchTrigger::ForceRefresh).await
    }

    pub async fn fetch_latest(&self, account_id: &AccountId) -> Result<SyncOutcome, EmailError> {
        self.run(account_id, FetchTrigger::FetchLatest).await
    }

    pub async fn check_latest(&self, account_id: &AccountId) -> Result<SyncOutcome, EmailError> {
        self.run(account_id, FetchTrigger::CheckLatest).await
    }

    /// Refreshes each account in turn. Session failures are recorded per account and do
    /// not stop the loop.
    pub async fn refresh_all(&self, accounts: &[Account]) -> RefreshAllSummary {
        let mut summary = RefreshAllSummary {
            total_accounts: accounts.len(),
            ..RefreshAllSummary::default()
        };

        for account in accounts {
            let entry = match self.sync_account(account, FetchTrigger::Refresh).await {
                Ok(outcome) => {
                    summary.success_count += 1;
                    summary.total_new += outcome.new_count;
                    AccountRefresh {
                        account_id: account.id.clone(),
                        email_address: account.email_address.clone(),
                        success: true,
                        new_count: outcome.new_count,
                        error: None,
                    }
                }
                Err(err) => {
                    if err.is_account_scoped() {
                        tracing::warn!(account = %account.id, error = %err, "account refresh failed");
                    } else {
                        tracing::error!(account = %account.id, error = %err, "account refresh failed");
                    }
                    summary.failure_count += 1;
                    AccountRefresh {
                        account_id: account.id.clone(),
                        email_address: account.email_address.clone(),
                        success: false,
                        new_count: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            summary.results.push(entry);
        }

        tracing::info!(
            accounts = summary.total_accounts,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            new = summary.total_new,
            "refresh-all finished"
        );
        summary
    }

    /// [`SyncService::refresh_all`] over every registered account marked active.
    pub async fn refresh_active(&self) -> RefreshAllSummary {
        let accounts = self
            .cache
            .accounts()
            .await
            .into_iter()
            .filter(|account| account.active)
            .collect::<Vec<_>>();
        self.refresh_all(&accounts).await
    }

    /// Sends through SMTP, then stores a read copy in the sent folder.
    pub async fn send(
        &self,
        account_id: &AccountId,
        outgoing: &OutgoingMail,
    ) -> Result<Message, EmailError> {
        outgoing.validate()?;
        let account = self.account(account_id).await?;

        self.backend.send_mail(&account, outgoing).await?;

        let message = Message {
            id: Uuid::new_v4(),
            account_id: account.id.clone(),
            message_id: None,
            subject: outgoing.subject.clone(),
            from: account.email_address.clone(),
            to: outgoing.to.clone(),
            cc: outgoing.cc.clone(),
            bcc: outgoing.bcc.clone(),
            body_text: outgoing.body.clone(),
            body_html: outgoing.body_html.clone(),
            attachments: Vec::new(),
            folder: MailFolder::Sent,
            is_read: true,
            is_starred: false,
            received_at: Utc::now(),
        };
        if !self.cache.insert(&account.id, message.clone()).await {
            tracing::warn!(account = %account.id, "account removed during send; sent copy not cached");
        }
        Ok(message)
    }

    pub async fn create_local(
        &self,
        account_id: &AccountId,
        local: LocalMessage,
    ) -> Result<Message, EmailError> {
        let missing = [
            ("subject", &local.subject),
            ("from", &local.from),
            ("to", &local.to),
            ("body", &local.body),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(EmailError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let account = self.account(account_id).await?;
        let message = Message {
            id: Uuid::new_v4(),
            account_id: account.id.clone(),
            message_id: None,
            subject: local.subject,
            from: local.from,
            to: local.to,
            cc: local.cc,
            bcc: local.bcc,
            body_text: local.body,
            body_html: local.body_html,
            attachments: Vec::new(),
            folder: local.folder.unwrap_or(MailFolder::Sent),
            is_read: true,
            is_starred: false,
            received_at: Utc::now(),
        };
        if !self.cache.insert(&account.id, message.clone()).await {
            return Err(not_found_account(&account.id));
        }
        Ok(message)
    }

    pub async fn message(&self, message_id: Uuid) -> Result<Message, EmailError> {
        self.cache
            .locate(message_id)
            .await
            .ok_or_else(|| not_found_message(message_id))
    }

    pub async fn update_message(
        &self,
        message_id: Uuid,
        patch: &MessagePatch,
    ) -> Result<Message, EmailError> {
        if self.cache.update_message(message_id, patch).await.is_none() {
            return Err(not_found_message(message_id));
        }
        self.message(message_id).await
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<AccountId, EmailError> {
        self.cache
            .delete_message(message_id)
            .await
            .ok_or_else(|| not_found_message(message_id))
    }

    async fn account(&self, account_id: &AccountId) -> Result<Account, EmailError> {
        self.cache
            .account(account_id)
            .await
            .ok_or_else(|| not_found_account(account_id))
    }

    async fn run(
        &self,
        account_id: &AccountId,
        trigger: FetchTrigger,
    ) -> Result<SyncOutcome, EmailError> {
        let account = self.account(account_id).await?;
        self.sync_account(&account, trigger).await
    }

    async fn sync_account(
        &self,
        account: &Account,
        trigger: FetchTrigger,
    ) -> Result<SyncOutcome, EmailError> {
        if !self.backend.test_connection(account).await {
            return Err(EmailError::Connection(format!(
                "could not connect to {} as {}",
                account.imap_host, account.email_address
            )));
        }

        let raws = self.backend.fetch_messages(account, MailFolder::Inbox).await?;
        let parsed = parse_batch(&raws);
        let fetched = parsed.len();
        let (selected, window) = self.windows.select(trigger, parsed, Utc::now());
        let batch = selected
            .into_iter()
            .map(|parsed| parsed.into_message(&account.id, MailFolder::Inbox))
            .collect::<Vec<_>>();

        let (emails, new_count) = match trigger {
            FetchTrigger::Refresh | FetchTrigger::FetchLatest => {
                let inserted = self
                    .cache
                    .merge(&account.id, batch)
                    .await
                    .ok_or_else(|| not_found_account(&account.id))?;
                let new_count = inserted.len();
                (inserted, new_count)
            }
            FetchTrigger::CheckLatest => {
                let inserted = self
                    .cache
                    .merge_loose(&account.id, batch, self.windows.similarity)
                    .await
                    .ok_or_else(|| not_found_account(&account.id))?;
                let new_count = inserted.len();
                (inserted, new_count)
            }
            FetchTrigger::FetchAll | FetchTrigger::ForceRefresh => {
                let observed = batch
                    .iter()
                    .filter_map(Message::identifier)
                    .map(str::to_string)
                    .collect::<HashSet<_>>();
                let inserted = self
                    .cache
                    .replace(&account.id, batch)
                    .await
                    .ok_or_else(|| not_found_account(&account.id))?;
                let emails = self
                    .cache
                    .messages(&account.id, MailFolder::Inbox)
                    .await
                    .into_iter()
                    .filter(|message| {
                        message
                            .identifier()
                            .is_some_and(|identifier| observed.contains(identifier))
                    })
                    .collect::<Vec<_>>();
                (emails, inserted.len())
            }
        };

        let total = self.cache.email_count(&account.id, None).await;
        tracing::info!(
            account = %account.id,
            trigger = trigger.label(),
            fetched,
            new = new_count,
            total,
            "sync finished"
        );

        Ok(SyncOutcome {
            message: describe(trigger, emails.len(), new_count),
            count: emails.len(),
            new_count,
            total,
            emails,
            source: "server",
            window_minutes: window.map(|window| window.num_minutes()),
        })
    }
}

fn describe(trigger: FetchTrigger, count: usize, new_count: usize) -> String {
    match trigger {
        FetchTrigger::FetchAll | FetchTrigger::ForceRefresh => {
            format!("Fetched {count} messages from server ({new_count} new)")
        }
        _ if new_count == 0 => "No new messages".to_string(),
        _ => format!("Fetched {new_count} new messages"),
    }
}

fn not_found_account(account_id: &AccountId) -> EmailError {
    EmailError::NotFound(format!("account {account_id}"))
}

fn not_found_message(message_id: Uuid) -> EmailError {
    EmailError::NotFound(format!("message {message_id}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::RawMessage;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    pub(crate) struct FakeBackend {
        unreachable: Mutex<HashSet<AccountId>>,
        failing_fetch: Mutex<HashSet<AccountId>>,
        inbox: Mutex<HashMap<AccountId, Vec<RawMessage>>>,
        sent: Mutex<Vec<OutgoingMail>>,
        pub(crate) fetch_calls: AtomicUsize,
    }

    impl FakeBackend {
        pub(crate) fn set_reachable(&self, account_id: &AccountId, reachable: bool) {
            let mut unreachable = self.unreachable.lock().expect("lock");
            if reachable {
                unreachable.remove(account_id);
            } else {
                unreachable.insert(account_id.clone());
            }
        }

        pub(crate) fn fail_fetch(&self, account_id: &AccountId) {
            self.failing_fetch
                .lock()
                .expect("lock")
                .insert(account_id.clone());
        }

        pub(crate) fn deliver(&self, account_id: &AccountId, raw: RawMessage) {
            self.inbox
                .lock()
                .expect("lock")
                .entry(account_id.clone())
                .or_default()
                .push(raw);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl MailBackend for FakeBackend {
        async fn test_connection(&self, account: &Account) -> bool {
            !self.unreachable.lock().expect("lock").contains(&account.id)
        }

        async fn fetch_messages(
            &self,
            account: &Account,
            _folder: MailFolder,
        ) -> Result<Vec<RawMessage>, EmailError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_fetch.lock().expect("lock").contains(&account.id) {
                return Err(EmailError::Fetch(format!(
                    "UID FETCH rejected for {}",
                    account.email_address
                )));
            }
            Ok(self
                .inbox
                .lock()
                .expect("lock")
                .get(&account.id)
                .cloned()
                .unwrap_or_default())
        }

        async fn send_mail(
            &self,
            _account: &Account,
            outgoing: &OutgoingMail,
        ) -> Result<(), EmailError> {
            self.sent.lock().expect("lock").push(outgoing.clone());
            Ok(())
        }
    }

    /// Holds `fetch_messages` until released, so tests can act while a fetch is in flight.
    #[derive(Default)]
    struct GatedBackend {
        fetch_started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MailBackend for GatedBackend {
        async fn test_connection(&self, _account: &Account) -> bool {
            true
        }

        async fn fetch_messages(
            &self,
            _account: &Account,
            _folder: MailFolder,
        ) -> Result<Vec<RawMessage>, EmailError> {
            self.fetch_started.notify_one();
            self.release.notified().await;
            Ok(vec![raw(Some("<late@x>"), "late", "a@x.com", Utc::now())])
        }

        async fn send_mail(
            &self,
            _account: &Account,
            _outgoing: &OutgoingMail,
        ) -> Result<(), EmailError> {
            Ok(())
        }
    }

    pub(crate) fn account(id: &str) -> Account {
        Account {
            id: AccountId::from(id),
            email_address: format!("{id}@example.com"),
            password: Some("secret".to_string()),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            active: true,
        }
    }

    pub(crate) fn raw(
        message_id: Option<&str>,
        subject: &str,
        from: &str,
        received_at: DateTime<Utc>,
    ) -> RawMessage {
        let mut headers = String::new();
        if let Some(message_id) = message_id {
            headers.push_str(&format!("Message-ID: {message_id}\r\n"));
        }
        headers.push_str(&format!(
            "Subject: {subject}\r\nFrom: {from}\r\nTo: me@example.com\r\nDate: {}\r\n\r\nbody\r\n",
            received_at.format("%a, %d %b %Y %H:%M:%S +0000")
        ));
        RawMessage {
            rfc822: headers.into_bytes(),
            ..RawMessage::default()
        }
    }

    pub(crate) async fn service_with(accounts: &[&str]) -> (SyncService, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let cache = Arc::new(AccountCache::new());
        for id in accounts {
            cache.upsert_account(account(id)).await;
        }
        let service = SyncService::new(cache, backend.clone(), FetchWindows::default());
        (service, backend)
    }

    fn outgoing() -> OutgoingMail {
        OutgoingMail {
            to: "bob@example.com".to_string(),
            subject: "Lunch".to_string(),
            body: "Noon?".to_string(),
            body_html: None,
            cc: None,
            bcc: None,
        }
    }

    #[tokio::test]
    async fn refresh_returns_only_new_messages() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        let now = Utc::now();
        backend.deliver(&id, raw(Some("<m1@x>"), "one", "a@x.com", now));
        backend.deliver(&id, raw(Some("<m2@x>"), "two", "a@x.com", now));

        let first = service.refresh(&id).await.expect("refresh");
        assert_eq!(first.count, 2);
        assert_eq!(first.source, "server");

        backend.deliver(&id, raw(Some("<m3@x>"), "three", "a@x.com", now));
        let second = service.refresh(&id).await.expect("refresh");
        assert_eq!(second.count, 1);
        assert_eq!(second.emails[0].subject, "three");
        assert_eq!(second.total, 3);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let (service, _) = service_with(&[]).await;
        let missing = AccountId::from("ghost");

        assert!(matches!(
            service.refresh(&missing).await,
            Err(EmailError::NotFound(_))
        ));
        assert!(matches!(
            service.send(&missing, &outgoing()).await,
            Err(EmailError::NotFound(_))
        ));
        assert!(matches!(
            service.remove_account(&missing).await,
            Err(EmailError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn connection_failure_aborts_without_touching_cache() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        backend.deliver(&id, raw(Some("<m1@x>"), "one", "a@x.com", Utc::now()));
        backend.set_reachable(&id, false);

        assert!(matches!(
            service.fetch_all(&id).await,
            Err(EmailError::Connection(_))
        ));
        assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.cache().email_count(&id, None).await, 0);
        assert!(service.cache().last_sync(&id).await.is_none());
    }

    #[tokio::test]
    async fn refresh_all_records_partial_failure() {
        let (service, backend) = service_with(&["acc1", "acc2", "acc3"]).await;
        let accounts = vec![account("acc1"), account("acc2"), account("acc3")];
        let now = Utc::now();
        for (index, acc) in accounts.iter().enumerate() {
            backend.deliver(
                &acc.id,
                raw(Some(&format!("<m{index}@x>")), "hello", "a@x.com", now),
            );
        }
        backend.set_reachable(&accounts[1].id, false);

        let summary = service.refresh_all(&accounts).await;

        assert_eq!(summary.total_accounts, 3);
        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.total_new, 2);
        assert!(summary.results[0].success);
        assert!(!summary.results[1].success);
        assert!(summary.results[1].error.is_some());
        assert!(summary.results[2].success);
        assert_eq!(service.cache().email_count(&accounts[2].id, None).await, 1);
    }

    #[tokio::test]
    async fn refresh_propagates_fetch_error() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        backend.deliver(&id, raw(Some("<m1@x>"), "one", "a@x.com", Utc::now()));
        backend.fail_fetch(&id);

        match service.refresh(&id).await {
            Err(EmailError::Fetch(detail)) => assert!(detail.contains("acc1@example.com")),
            other => panic!("expected fetch error, got {other:?}"),
        }
        assert_eq!(service.cache().email_count(&id, None).await, 0);
        assert!(service.cache().last_sync(&id).await.is_none());
    }

    #[tokio::test]
    async fn refresh_all_records_fetch_failure_per_account() {
        let (service, backend) = service_with(&["acc1", "acc2", "acc3"]).await;
        let accounts = vec![account("acc1"), account("acc2"), account("acc3")];
        let now = Utc::now();
        for (index, acc) in accounts.iter().enumerate() {
            backend.deliver(
                &acc.id,
                raw(Some(&format!("<f{index}@x>")), "hello", "a@x.com", now),
            );
        }
        backend.fail_fetch(&accounts[1].id);

        let summary = service.refresh_all(&accounts).await;

        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.total_new, 2);
        let failed = &summary.results[1];
        assert!(!failed.success);
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|error| error.contains("UID FETCH rejected")));
        assert!(summary.results[2].success);
        assert_eq!(service.cache().email_count(&accounts[1].id, None).await, 0);
        assert!(service.cache().last_sync(&accounts[1].id).await.is_none());
    }

    #[tokio::test]
    async fn removal_during_fetch_leaves_no_trace() {
        let backend = Arc::new(GatedBackend::default());
        let cache = Arc::new(AccountCache::new());
        cache.upsert_account(account("acc1")).await;
        let service = SyncService::new(cache.clone(), backend.clone(), FetchWindows::default());
        let id = AccountId::from("acc1");

        let refresh = tokio::spawn({
            let service = service.clone();
            let id = id.clone();
            async move { service.refresh(&id).await }
        });
        backend.fetch_started.notified().await;
        service.remove_account(&id).await.expect("removed");
        backend.release.notify_one();

        let result = refresh.await.expect("refresh task");
        assert!(matches!(result, Err(EmailError::NotFound(_))));
        assert!(cache.account(&id).await.is_none());
        assert!(cache.all_messages(&id).await.is_empty());
        assert!(cache.last_sync(&id).await.is_none());
    }

    #[tokio::test]
    async fn refresh_active_skips_inactive_accounts() {
        let (service, _) = service_with(&["acc1"]).await;
        let mut dormant = account("acc2");
        dormant.active = false;
        service.cache().upsert_account(dormant).await;

        let summary = service.refresh_active().await;
        assert_eq!(summary.total_accounts, 1);
        assert_eq!(summary.results[0].account_id, AccountId::from("acc1"));
    }

    #[tokio::test]
    async fn fetch_latest_falls_back_to_wider_window() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        let now = Utc::now();
        backend.deliver(&id, raw(Some("<old@x>"), "old", "a@x.com", now - Duration::minutes(200)));
        backend.deliver(&id, raw(Some("<mid@x>"), "mid", "a@x.com", now - Duration::minutes(45)));

        let outcome = service.fetch_latest(&id).await.expect("fetch latest");
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.emails[0].subject, "mid");
        assert_eq!(outcome.window_minutes, Some(60));
    }

    #[tokio::test]
    async fn fetch_all_reports_everything_observed() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        let now = Utc::now();
        backend.deliver(&id, raw(Some("<m1@x>"), "one", "a@x.com", now - Duration::days(3)));
        service.refresh(&id).await.expect("refresh");
        backend.deliver(&id, raw(Some("<m2@x>"), "two", "a@x.com", now));

        let outcome = service.force_refresh(&id).await.expect("force refresh");
        assert_eq!(outcome.count, 2);
        assert_eq!(outcome.new_count, 1);
        assert_eq!(outcome.window_minutes, None);
        assert_eq!(service.cache().email_count(&id, None).await, 2);
    }

    #[tokio::test]
    async fn check_latest_suppresses_similar_messages_without_identifier() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        let cached_at = Utc::now() - Duration::minutes(2);

        let mut existing = raw(None, "Hi", "sam@x.com", cached_at);
        existing.seen = true;
        let existing = crate::parse_message(&existing)
            .expect("parsed")
            .into_message(&id, MailFolder::Inbox);
        service.cache().insert(&id, existing).await;

        backend.deliver(&id, raw(None, "Hi", "sam@x.com", cached_at - Duration::seconds(5)));
        backend.deliver(&id, raw(None, "Hi", "sam@x.com", cached_at + Duration::seconds(5)));

        let outcome = service.check_latest(&id).await.expect("check latest");
        assert_eq!(outcome.count, 0);
        assert_eq!(service.cache().email_count(&id, None).await, 1);
    }

    #[tokio::test]
    async fn check_latest_ignores_older_mail() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        let now = Utc::now();
        backend.deliver(&id, raw(Some("<new@x>"), "new", "a@x.com", now - Duration::minutes(1)));
        backend.deliver(&id, raw(Some("<old@x>"), "old", "a@x.com", now - Duration::minutes(20)));

        let outcome = service.check_latest(&id).await.expect("check latest");
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.emails[0].subject, "new");
        assert_eq!(outcome.window_minutes, Some(5));
    }

    #[tokio::test]
    async fn sent_copy_is_read_and_does_not_affect_inbox_checks() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");

        let sent = service.send(&id, &outgoing()).await.expect("send");
        assert_eq!(sent.folder, MailFolder::Sent);
        assert!(sent.is_read);
        assert_eq!(sent.from, "acc1@example.com");
        assert_eq!(backend.sent_count(), 1);
        assert_eq!(service.cache().messages(&id, MailFolder::Sent).await.len(), 1);

        backend.deliver(&id, raw(None, "Lunch", "acc1@example.com", Utc::now()));
        let outcome = service.check_latest(&id).await.expect("check latest");
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.emails[0].folder, MailFolder::Inbox);
        assert_eq!(service.cache().messages(&id, MailFolder::Sent).await.len(), 1);
    }

    #[tokio::test]
    async fn send_validates_before_contacting_server() {
        let (service, backend) = service_with(&["acc1"]).await;
        let mut mail = outgoing();
        mail.subject.clear();

        assert!(matches!(
            service.send(&AccountId::from("acc1"), &mail).await,
            Err(EmailError::Validation(_))
        ));
        assert_eq!(backend.sent_count(), 0);
    }

    #[tokio::test]
    async fn create_local_requires_fields_and_defaults_to_sent() {
        let (service, _) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");

        assert!(matches!(
            service.create_local(&id, LocalMessage::default()).await,
            Err(EmailError::Validation(_))
        ));

        let local = LocalMessage {
            subject: "Draft".to_string(),
            from: "acc1@example.com".to_string(),
            to: "bob@example.com".to_string(),
            body: "text".to_string(),
            ..LocalMessage::default()
        };
        let created = service.create_local(&id, local).await.expect("created");
        assert_eq!(created.folder, MailFolder::Sent);
        assert!(created.is_read);
        assert_eq!(service.message(created.id).await.expect("stored").subject, "Draft");
    }

    #[tokio::test]
    async fn update_and_delete_by_message_id() {
        let (service, backend) = service_with(&["acc1"]).await;
        let id = AccountId::from("acc1");
        backend.deliver(&id, raw(Some("<m1@x>"), "one", "a@x.com", Utc::now()));
        let message_id = service.refresh(&id).await.expect("refresh").emails[0].id;

        let patch = MessagePatch {
            is_starred: Some(true),
            ..MessagePatch::default()
        };
        let updated = service
            .update_message(message_id, &patch)
            .await
            .expect("updated");
        assert!(updated.is_starred);

        assert_eq!(service.delete_message(message_id).await.expect("deleted"), id);
        assert!(matches!(
            service.delete_message(message_id).await,
            Err(EmailError::NotFound(_))
        ));
        assert!(matches!(
            service.update_message(message_id, &patch).await,
            Err(EmailError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn register_requires_reachable_server() {
        let (service, backend) = service_with(&[]).await;
        let acc = account("acc9");
        backend.set_reachable(&acc.id, false);

        assert!(matches!(
            service.register_account(acc.clone()).await,
            Err(EmailError::Connection(_))
        ));
        assert!(service.cache().account(&acc.id).await.is_none());

        backend.set_reachable(&acc.id, true);
        service.register_account(acc.clone()).await.expect("registered");
        assert!(service.cache().account(&acc.id).await.is_some());
        assert!(service.cache().last_sync(&acc.id).await.is_none());
    }
}
