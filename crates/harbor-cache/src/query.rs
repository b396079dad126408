use harbor_core::{MailFolder, Message};
use serde::{Deserialize, Serialize};

pub const MAX_QUERY_RESULTS: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    Date,
    /// Ascending by subject.
    Subject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailQuery {
    pub folder: MailFolder,
    pub search: Option<String>,
    pub sort: SortOrder,
    pub limit: usize,
}

impl Default for MailQuery {
    fn default() -> Self {
        Self {
            folder: MailFolder::Inbox,
            search: None,
            sort: SortOrder::Date,
            limit: MAX_QUERY_RESULTS,
        }
    }
}

impl MailQuery {
    pub fn folder(folder: MailFolder) -> Self {
        Self {
            folder,
            ..Self::default()
        }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn sorted_by(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub(crate) fn run<'a>(&self, messages: impl Iterator<Item = &'a Message>) -> Vec<Message> {
        let needle = self
            .search
            .as_deref()
            .map(str::trim)
            .filter(|needle| !needle.is_empty())
            .map(str::to_lowercase);

        let mut matched = messages
            .filter(|message| message.folder == self.folder)
            .filter(|message| match &needle {
                Some(needle) => matches_search(message, needle),
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();

        match self.sort {
            SortOrder::Date => matched.sort_by(|a, b| b.received_at.cmp(&a.received_at)),
            SortOrder::Subject => matched.sort_by(|a, b| a.subject.cmp(&b.subject)),
        }

        matched.truncate(self.limit.min(MAX_QUERY_RESULTS));
        matched
    }
}

fn matches_search(message: &Message, needle: &str) -> bool {
    message.subject.to_lowercase().contains(needle)
        || message.from.to_lowercase().contains(needle)
        || message.body_text.to_lowercase().contains(needle)
}
