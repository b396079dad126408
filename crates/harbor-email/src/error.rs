use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("mail parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("smtp transport error: {0}")]
    Send(String),
    #[error("message build error: {0}")]
    Build(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
    #[error("background task failed: {0}")]
    Task(String),
}

impl EmailError {
    /// Failures that belong to one account's remote session. Multi-account runs record
    /// these per account instead of aborting.
    pub fn is_account_scoped(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Fetch(_) | Self::Timeout { .. } | Self::Task(_)
        )
    }
}
