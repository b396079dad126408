use crate::{CacheSnapshot, MailQuery};
use chrono::{DateTime, Duration, Utc};
use harbor_core::{Account, AccountId, MailFolder, Message, MessagePatch, SyncMetadata};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

#[derive(Debug, Default)]
struct AccountEntry {
    account: Option<Account>,
    /// Arrival order, not chronological.
    messages: Vec<Message>,
    sync: SyncMetadata,
    /// Set once the entry has left the map; late writers must not use it.
    retired: bool,
}

impl AccountEntry {
    fn identifiers(&self) -> HashSet<String> {
        self.messages
            .iter()
            .filter_map(Message::identifier)
            .map(str::to_string)
            .collect()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        let next = match self.sync.last_sync {
            Some(previous) => previous.max(now),
            None => now,
        };
        self.sync.last_sync = Some(next);
    }

    /// Appends every message whose identifier is new, in batch order. Messages without an
    /// identifier are dropped.
    fn absorb(&mut self, account_id: &AccountId, batch: Vec<Message>) -> Vec<Message> {
        let mut known = self.identifiers();
        let mut inserted = Vec::new();

        for mut message in batch {
            let Some(identifier) = message.identifier().map(str::to_string) else {
                continue;
            };
            if !known.insert(identifier) {
                continue;
            }

            message.account_id = account_id.clone();
            inserted.push(message.clone());
            self.messages.push(message);
        }

        self.touch(Utc::now());
        inserted
    }

    fn absorb_loose(
        &mut self,
        account_id: &AccountId,
        batch: Vec<Message>,
        window: Duration,
    ) -> Vec<Message> {
        let mut known = self.identifiers();
        let cached = self.messages.len();
        let mut inserted = Vec::new();

        for mut message in batch {
            match message.identifier().map(str::to_string) {
                Some(identifier) => {
                    if !known.insert(identifier) {
                        continue;
                    }
                }
                None => {
                    let similar = self.messages[..cached].iter().any(|existing| {
                        existing.folder == message.folder && existing.resembles(&message, window)
                    });
                    if similar {
                        continue;
                    }
                }
            }

            message.account_id = account_id.clone();
            inserted.push(message.clone());
            self.messages.push(message);
        }

        self.touch(Utc::now());
        inserted
    }
}

type SharedEntry = Arc<RwLock<AccountEntry>>;

/// In-memory message store keyed by account.
///
/// Each account sits behind its own lock: writers to one account are serialized while
/// other accounts proceed independently, and readers always see a whole message list.
/// Removing an account drops its messages and sync metadata in a single map operation.
#[derive(Debug, Default)]
pub struct AccountCache {
    entries: RwLock<HashMap<AccountId, SharedEntry>>,
}

impl AccountCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, account_id: &AccountId) -> Option<SharedEntry> {
        self.entries.read().await.get(account_id).cloned()
    }

    /// Write access to a registered account, or `None` when it is unknown or was removed
    /// while the caller waited for the lock.
    async fn writable(&self, account_id: &AccountId) -> Option<OwnedRwLockWriteGuard<AccountEntry>> {
        let entry = self.entry(account_id).await?;
        let guard = entry.write_owned().await;
        (!guard.retired).then_some(guard)
    }

    async fn all_entries(&self) -> Vec<(AccountId, SharedEntry)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Registers the account, or replaces its settings when already registered. Messages and
    /// sync metadata of an existing registration are kept.
    pub async fn upsert_account(&self, account: Account) {
        let entry = self
            .entries
            .write()
            .await
            .entry(account.id.clone())
            .or_default()
            .clone();
        entry.write().await.account = Some(account);
    }

    pub async fn account(&self, account_id: &AccountId) -> Option<Account> {
        let entry = self.entry(account_id).await?;
        let guard = entry.read().await;
        guard.account.clone()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        let mut accounts = Vec::new();
        for (_, entry) in self.all_entries().await {
            if let Some(account) = entry.read().await.account.clone() {
                accounts.push(account);
            }
        }
        accounts.sort_by(|a, b| a.email_address.cmp(&b.email_address));
        accounts
    }

    /// Drops the account together with all of its messages and sync metadata.
    pub async fn remove_account(&self, account_id: &AccountId) -> bool {
        let Some(entry) = self.entries.write().await.remove(account_id) else {
            return false;
        };
        entry.write().await.retired = true;
        tracing::debug!(account = %account_id, "account removed from cache");
        true
    }

    /// Messages of `account_id` tagged with `folder`, in arrival order.
    pub async fn messages(&self, account_id: &AccountId, folder: MailFolder) -> Vec<Message> {
        let Some(entry) = self.entry(account_id).await else {
            return Vec::new();
        };
        let guard = entry.read().await;
        guard
            .messages
            .iter()
            .filter(|message| message.folder == folder)
            .cloned()
            .collect()
    }

    pub async fn all_messages(&self, account_id: &AccountId) -> Vec<Message> {
        let Some(entry) = self.entry(account_id).await else {
            return Vec::new();
        };
        let guard = entry.read().await;
        guard.messages.clone()
    }

    pub async fn query(&self, account_id: &AccountId, query: &MailQuery) -> Vec<Message> {
        let Some(entry) = self.entry(account_id).await else {
            return Vec::new();
        };
        let guard = entry.read().await;
        query.run(guard.messages.iter())
    }

    /// Inserts the messages whose identifier is not cached yet and returns them.
    ///
    /// Idempotent: merging the same batch again inserts nothing. The sync timestamp is
    /// refreshed even when the batch is empty. Returns `None` when the account is not
    /// registered, including when it was removed while the batch was being fetched.
    pub async fn merge(&self, account_id: &AccountId, batch: Vec<Message>) -> Option<Vec<Message>> {
        let mut guard = self.writable(account_id).await?;
        let incoming = batch.len();
        let inserted = guard.absorb(account_id, batch);
        tracing::debug!(
            account = %account_id,
            incoming,
            inserted = inserted.len(),
            total = guard.messages.len(),
            "merged batch into cache"
        );
        Some(inserted)
    }

    /// Used by fetch-all and force-refresh.
    ///
    /// Despite the name this never discards cached messages: it dedups against the
    /// existing set exactly like [`AccountCache::merge`]. Messages deleted on the server
    /// therefore stay cached until [`AccountCache::cleanup`] ages them out.
    pub async fn replace(
        &self,
        account_id: &AccountId,
        batch: Vec<Message>,
    ) -> Option<Vec<Message>> {
        self.merge(account_id, batch).await
    }

    /// Merge variant for the quick check: messages without an identifier are kept unless a
    /// cached message in the same folder has the same subject and sender and was received
    /// within `window` of it. Messages of the same batch never suppress each other.
    pub async fn merge_loose(
        &self,
        account_id: &AccountId,
        batch: Vec<Message>,
        window: Duration,
    ) -> Option<Vec<Message>> {
        let mut guard = self.writable(account_id).await?;
        Some(guard.absorb_loose(account_id, batch, window))
    }

    /// Stores a locally authored message. Returns `false` when the account is not registered
    /// or the message's non-empty identifier is already cached.
    pub async fn insert(&self, account_id: &AccountId, mut message: Message) -> bool {
        let Some(mut guard) = self.writable(account_id).await else {
            return false;
        };

        if let Some(identifier) = message.identifier() {
            if guard
                .messages
                .iter()
                .any(|existing| existing.identifier() == Some(identifier))
            {
                return false;
            }
        }

        message.account_id = account_id.clone();
        guard.messages.push(message);
        guard.touch(Utc::now());
        true
    }

    pub async fn update(
        &self,
        account_id: &AccountId,
        message_id: Uuid,
        patch: &MessagePatch,
    ) -> bool {
        let Some(entry) = self.entry(account_id).await else {
            return false;
        };
        let mut guard = entry.write().await;
        match guard.messages.iter_mut().find(|message| message.id == message_id) {
            Some(message) => {
                patch.apply(message);
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, account_id: &AccountId, message_id: Uuid) -> bool {
        let Some(entry) = self.entry(account_id).await else {
            return false;
        };
        let mut guard = entry.write().await;
        let before = guard.messages.len();
        guard.messages.retain(|message| message.id != message_id);
        guard.messages.len() != before
    }

    /// Finds a message by its cache id across all accounts.
    pub async fn locate(&self, message_id: Uuid) -> Option<Message> {
        for (_, entry) in self.all_entries().await {
            let guard = entry.read().await;
            if let Some(message) = guard.messages.iter().find(|message| message.id == message_id)
            {
                return Some(message.clone());
            }
        }
        None
    }

    /// Applies `patch` to whichever account owns `message_id`.
    pub async fn update_message(
        &self,
        message_id: Uuid,
        patch: &MessagePatch,
    ) -> Option<AccountId> {
        for (account_id, entry) in self.all_entries().await {
            let mut guard = entry.write().await;
            if let Some(message) = guard
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
            {
                patch.apply(message);
                return Some(account_id);
            }
        }
        None
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Option<AccountId> {
        for (account_id, entry) in self.all_entries().await {
            let mut guard = entry.write().await;
            let before = guard.messages.len();
            guard.messages.retain(|message| message.id != message_id);
            if guard.messages.len() != before {
                return Some(account_id);
            }
        }
        None
    }

    pub async fn sync_metadata(&self, account_id: &AccountId) -> SyncMetadata {
        match self.entry(account_id).await {
            Some(entry) => entry.read().await.sync,
            None => SyncMetadata::default(),
        }
    }

    pub async fn last_sync(&self, account_id: &AccountId) -> Option<DateTime<Utc>> {
        self.sync_metadata(account_id).await.last_sync
    }

    /// True when the account never synced or its last sync is older than `max_age`.
    pub async fn is_sync_stale(&self, account_id: &AccountId, max_age: Duration) -> bool {
        self.sync_metadata(account_id)
            .await
            .is_stale(Utc::now(), max_age)
    }

    /// Number of messages, optionally restricted to one folder.
    pub async fn email_count(&self, account_id: &AccountId, folder: Option<MailFolder>) -> usize {
        let Some(entry) = self.entry(account_id).await else {
            return 0;
        };
        let guard = entry.read().await;
        match folder {
            Some(folder) => guard
                .messages
                .iter()
                .filter(|message| message.folder == folder)
                .count(),
            None => guard.messages.len(),
        }
    }

    pub async fn unread_count(&self, account_id: &AccountId, folder: MailFolder) -> usize {
        let Some(entry) = self.entry(account_id).await else {
            return 0;
        };
        let guard = entry.read().await;
        guard
            .messages
            .iter()
            .filter(|message| message.folder == folder && !message.is_read)
            .count()
    }

    /// Drops messages received before `now - max_age` in every account. Returns how many
    /// were removed. A non-positive age removes nothing.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        if max_age <= Duration::zero() {
            tracing::warn!(?max_age, "ignoring cleanup with non-positive age");
            return 0;
        }
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let mut removed = 0;

        for (account_id, entry) in self.all_entries().await {
            let mut guard = entry.write().await;
            let before = guard.messages.len();
            guard.messages.retain(|message| message.received_at > cutoff);
            let dropped = before - guard.messages.len();
            if dropped > 0 {
                tracing::debug!(account = %account_id, dropped, "expired cached messages");
            }
            removed += dropped;
        }

        removed
    }

    pub async fn export(&self) -> CacheSnapshot {
        let mut snapshot = CacheSnapshot::default();
        let mut entries = self.all_entries().await;
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (account_id, entry) in entries {
            let guard = entry.read().await;
            if let Some(account) = &guard.account {
                snapshot.accounts.push((account_id.clone(), account.clone()));
            }
            snapshot
                .emails
                .push((account_id.clone(), guard.messages.clone()));
            if let Some(last_sync) = guard.sync.last_sync {
                snapshot.last_sync.push((account_id, last_sync));
            }
        }

        snapshot
    }

    /// Replaces the whole cache with `snapshot`. Duplicate identifiers inside the snapshot
    /// are collapsed to their first occurrence; entries without an account are dropped.
    pub async fn import(&self, snapshot: CacheSnapshot) {
        let mut staged: HashMap<AccountId, AccountEntry> = HashMap::new();

        for (account_id, account) in snapshot.accounts {
            staged.entry(account_id).or_default().account = Some(account);
        }

        for (account_id, messages) in snapshot.emails {
            let entry = staged.entry(account_id.clone()).or_default();
            let mut known = entry.identifiers();
            for mut message in messages {
                if let Some(identifier) = message.identifier().map(str::to_string) {
                    if !known.insert(identifier) {
                        continue;
                    }
                }
                message.account_id = account_id.clone();
                entry.messages.push(message);
            }
        }

        for (account_id, last_sync) in snapshot.last_sync {
            staged.entry(account_id).or_default().sync.last_sync = Some(last_sync);
        }

        // Messages only exist under a registered account.
        staged.retain(|_, entry| entry.account.is_some());

        let next = staged
            .into_iter()
            .map(|(id, entry)| (id, Arc::new(RwLock::new(entry))))
            .collect::<HashMap<_, _>>();

        let previous = std::mem::replace(&mut *self.entries.write().await, next);
        for entry in previous.into_values() {
            entry.write().await.retired = true;
        }
    }
}
