mod backend;
mod error;
mod parser;
mod policy;
mod scheduler;
mod service;

pub use backend::{BackendSettings, ImapSmtpBackend, MailBackend, OutgoingMail};
pub use error::EmailError;
pub use parser::{parse_batch, parse_message, ParsedMessage, RawMessage, NO_SUBJECT};
pub use policy::{FetchTrigger, FetchWindows, SearchPlan};
pub use scheduler::{PollMode, PollScheduler, PollSettings};
pub use service::{AccountRefresh, LocalMessage, RefreshAllSummary, SyncOutcome, SyncService};
