use crate::ParsedMessage;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// What asked for a sync. Decides how the fetched batch is narrowed before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTrigger {
    /// Manual or scheduled refresh: whole batch, additive merge.
    Refresh,
    FetchAll,
    ForceRefresh,
    /// Last `latest` window, widened to `latest_fallback` when that is empty.
    FetchLatest,
    /// Background quick check over the last `quick_check` window.
    CheckLatest,
}

impl FetchTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::FetchAll => "fetch-all",
            Self::ForceRefresh => "force-refresh",
            Self::FetchLatest => "fetch-latest",
            Self::CheckLatest => "check-latest",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchWindows {
    pub quick_check: Duration,
    pub latest: Duration,
    pub latest_fallback: Duration,
    /// Max receive-time distance for two identifier-less messages to count as the same.
    pub similarity: Duration,
}

impl Default for FetchWindows {
    fn default() -> Self {
        Self {
            quick_check: Duration::minutes(5),
            latest: Duration::minutes(30),
            latest_fallback: Duration::minutes(60),
            similarity: Duration::seconds(60),
        }
    }
}

impl FetchWindows {
    /// Narrows an already fetched batch for `trigger`. Returns the surviving messages and
    /// the window that produced them (`None` when no filter applies).
    pub fn select(
        &self,
        trigger: FetchTrigger,
        batch: Vec<ParsedMessage>,
        now: DateTime<Utc>,
    ) -> (Vec<ParsedMessage>, Option<Duration>) {
        match trigger {
            FetchTrigger::Refresh | FetchTrigger::FetchAll | FetchTrigger::ForceRefresh => {
                (batch, None)
            }
            FetchTrigger::CheckLatest => {
                let window = self.quick_check;
                (within(batch, now, window), Some(window))
            }
            FetchTrigger::FetchLatest => {
                let primary = within(batch.clone(), now, self.latest);
                if !primary.is_empty() {
                    return (primary, Some(self.latest));
                }
                let window = self.latest_fallback;
                (within(batch, now, window), Some(window))
            }
        }
    }
}

fn within(batch: Vec<ParsedMessage>, now: DateTime<Utc>, window: Duration) -> Vec<ParsedMessage> {
    let since = saturating_before(now, Some(window));
    batch
        .into_iter()
        .filter(|message| message.received_at > since)
        .collect()
}

/// Server-side selection: unread mail from the last `unread_days`, read mail from the last
/// `read_days`, newest `limit` by UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPlan {
    pub unread_days: i64,
    pub read_days: i64,
    pub limit: usize,
}

impl Default for SearchPlan {
    fn default() -> Self {
        Self {
            unread_days: 7,
            read_days: 1,
            limit: 100,
        }
    }
}

impl SearchPlan {
    pub fn unread_query(&self, now: DateTime<Utc>) -> String {
        let since = saturating_before(now, Duration::try_days(self.unread_days));
        format!("UNSEEN SINCE {}", imap_date(since))
    }

    pub fn read_query(&self, now: DateTime<Utc>) -> String {
        let since = saturating_before(now, Duration::try_days(self.read_days));
        format!("SEEN SINCE {}", imap_date(since))
    }

    /// Union of both result sets, newest first, capped at `limit`.
    pub fn select_uids(
        &self,
        unread: impl IntoIterator<Item = u32>,
        read: impl IntoIterator<Item = u32>,
    ) -> Vec<u32> {
        let union = unread.into_iter().chain(read).collect::<BTreeSet<_>>();
        union.into_iter().rev().take(self.limit).collect()
    }
}

/// `now - span`, saturating at the earliest representable instant.
fn saturating_before(now: DateTime<Utc>, span: Option<Duration>) -> DateTime<Utc> {
    span.and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%d-%b-%Y").to_string()
}
