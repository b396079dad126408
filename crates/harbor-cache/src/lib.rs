mod cache;
mod error;
mod query;
mod snapshot;

pub use cache::AccountCache;
pub use error::CacheError;
pub use query::{MailQuery, SortOrder, MAX_QUERY_RESULTS};
pub use snapshot::CacheSnapshot;
