use crate::{EmailError, RawMessage, SearchPlan};
use async_trait::async_trait;
use chrono::Utc;
use harbor_core::{Account, MailFolder};
use lettre::message::{header, Mailbox, MultiPart, SinglePart};
use lettre::{
    transport::smtp::authentication::Credentials, AsyncSmtpTransport, AsyncTransport, Message,
    Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub body_html: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
}

impl OutgoingMail {
    pub fn validate(&self) -> Result<(), EmailError> {
        let mut missing = Vec::new();
        if self.to.trim().is_empty() {
            missing.push("to");
        }
        if self.subject.trim().is_empty() {
            missing.push("subject");
        }
        if self.body.trim().is_empty() {
            missing.push("body");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EmailError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Remote mailbox session primitives. Implementations bound every call with a timeout.
#[async_trait]
pub trait MailBackend: Send + Sync {
    /// Opens a session, selects the inbox and closes it again. Never fails: any problem
    /// reduces to `false`.
    async fn test_connection(&self, account: &Account) -> bool;

    async fn fetch_messages(
        &self,
        account: &Account,
        folder: MailFolder,
    ) -> Result<Vec<RawMessage>, EmailError>;

    async fn send_mail(&self, account: &Account, outgoing: &OutgoingMail)
        -> Result<(), EmailError>;
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
    pub send_timeout: Duration,
    pub search: SearchPlan,
    pub inbox_folder: String,
    pub sent_folder: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
            search: SearchPlan::default(),
            inbox_folder: "INBOX".to_string(),
            sent_folder: "Sent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImapSmtpBackend {
    settings: BackendSettings,
}

impl ImapSmtpBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn mailbox_name(&self, folder: MailFolder) -> &str {
        match folder {
            MailFolder::Inbox => &self.settings.inbox_folder,
            MailFolder::Sent => &self.settings.sent_folder,
        }
    }
}

#[async_trait]
impl MailBackend for ImapSmtpBackend {
    async fn test_connection(&self, account: &Account) -> bool {
        let account_copy = account.clone();
        let inbox = self.settings.inbox_folder.clone();

        let probe = run_blocking("imap probe", self.settings.probe_timeout, move || {
            probe_imap(&account_copy, &inbox)
        })
        .await;

        match probe {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(account = %account.id, error = %err, "imap connection test failed");
                false
            }
        }
    }

    async fn fetch_messages(
        &self,
        account: &Account,
        folder: MailFolder,
    ) -> Result<Vec<RawMessage>, EmailError> {
        let account_copy = account.clone();
        let mailbox = self.mailbox_name(folder).to_string();
        let plan = self.settings.search;
        let budget = self.settings.connect_timeout + self.settings.fetch_timeout;

        let messages = run_blocking("imap fetch", budget, move || {
            fetch_recent_imap(&account_copy, &mailbox, &plan)
        })
        .await?;

        tracing::info!(
            account = %account.id,
            folder = %folder,
            fetched = messages.len(),
            "fetched messages from server"
        );
        Ok(messages)
    }

    async fn send_mail(
        &self,
        account: &Account,
        outgoing: &OutgoingMail,
    ) -> Result<(), EmailError> {
        outgoing.validate()?;

        let from = account
            .email_address
            .parse::<Mailbox>()
            .map_err(|err| EmailError::Build(format!("invalid sender {}: {err}", account.email_address)))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(outgoing.subject.clone());

        for mailbox in parse_mailboxes(&outgoing.to)? {
            builder = builder.to(mailbox);
        }
        if let Some(cc) = &outgoing.cc {
            for mailbox in parse_mailboxes(cc)? {
                builder = builder.cc(mailbox);
            }
        }
        if let Some(bcc) = &outgoing.bcc {
            for mailbox in parse_mailboxes(bcc)? {
                builder = builder.bcc(mailbox);
            }
        }

        let html = outgoing
            .body_html
            .clone()
            .unwrap_or_else(|| outgoing.body.clone());
        let alternative = MultiPart::alternative()
            .singlepart(SinglePart::plain(outgoing.body.clone()))
            .singlepart(
                SinglePart::builder()
                    .header(header::ContentType::TEXT_HTML)
                    .body(html),
            );

        let message = builder
            .multipart(alternative)
            .map_err(|err| EmailError::Build(err.to_string()))?;

        let host = account.smtp_host.as_str();
        let transport = if account.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        }
        .map_err(|err| EmailError::Send(err.to_string()))?
        .port(account.smtp_port)
        .timeout(Some(self.settings.send_timeout));

        let transport = match &account.password {
            Some(password) => transport.credentials(Credentials::new(
                account.email_address.clone(),
                password.clone(),
            )),
            None => transport,
        };

        transport
            .build()
            .send(message)
            .await
            .map_err(|err| EmailError::Send(err.to_string()))?;

        tracing::info!(account = %account.id, to = %outgoing.to, "message sent");
        Ok(())
    }
}

/// Runs a synchronous imap job on the blocking pool and stops waiting after `limit`.
/// The blocking job itself is not cancelled; it ends with its own socket timeouts.
async fn run_blocking<T, F>(
    operation: &'static str,
    limit: Duration,
    job: F,
) -> Result<T, EmailError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmailError> + Send + 'static,
{
    bounded(operation, limit, task::spawn_blocking(job)).await
}

async fn bounded<T, Fut>(operation: &'static str, limit: Duration, job: Fut) -> Result<T, EmailError>
where
    Fut: Future<Output = Result<Result<T, EmailError>, task::JoinError>>,
{
    match tokio::time::timeout(limit, job).await {
        Ok(joined) => joined.map_err(|err| EmailError::Task(format!("{operation} task failed: {err}")))?,
        Err(_) => Err(EmailError::Timeout {
            operation,
            secs: limit.as_secs(),
        }),
    }
}

fn parse_mailboxes(raw: &str) -> Result<Vec<Mailbox>, EmailError> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<Mailbox>()
                .map_err(|err| EmailError::Validation(format!("invalid address {value}: {err}")))
        })
        .collect()
}

type ImapSession = imap::Session<imap::Connection>;

fn connect_imap_session(account: &Account) -> Result<ImapSession, EmailError> {
    let client = imap::ClientBuilder::new(account.imap_host.as_str(), account.imap_port)
        .connect()
        .map_err(|err| EmailError::Connection(format!("imap connect: {err}")))?;

    let password = account.password.as_ref().ok_or_else(|| {
        EmailError::Connection("missing password for imap login".to_string())
    })?;

    client
        .login(account.email_address.clone(), password.clone())
        .map_err(|err| EmailError::Connection(format!("imap login: {}", err.0)))
}

fn probe_imap(account: &Account, inbox: &str) -> Result<(), EmailError> {
    let mut session = connect_imap_session(account)?;
    let selected = session
        .select(inbox)
        .map_err(|err| EmailError::Connection(format!("select {inbox}: {err}")));
    let _ = session.logout();
    selected.map(|_| ())
}

fn fetch_recent_imap(
    account: &Account,
    mailbox: &str,
    plan: &SearchPlan,
) -> Result<Vec<RawMessage>, EmailError> {
    let mut session = connect_imap_session(account)?;
    let result = fetch_selected(&mut session, mailbox, plan);
    let _ = session.logout();
    result
}

fn fetch_selected(
    session: &mut ImapSession,
    mailbox: &str,
    plan: &SearchPlan,
) -> Result<Vec<RawMessage>, EmailError> {
    session
        .select(mailbox)
        .map_err(|err| EmailError::Connection(format!("select {mailbox}: {err}")))?;

    let now = Utc::now();
    let unread = session.uid_search(plan.unread_query(now)).map_err(fetch_error)?;
    let read = session.uid_search(plan.read_query(now)).map_err(fetch_error)?;
    tracing::debug!(unread = unread.len(), read = read.len(), "imap search matched");

    let uids = plan.select_uids(unread, read);
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let sequence = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let fetches = session
        .uid_fetch(sequence, "(UID FLAGS INTERNALDATE BODY.PEEK[])")
        .map_err(fetch_error)?;

    let mut messages = Vec::with_capacity(uids.len());
    for fetched in fetches.iter() {
        let Some(body) = fetched.body() else {
            tracing::warn!(uid = ?fetched.uid, "server returned no body; skipping");
            continue;
        };

        let mut raw = RawMessage {
            uid: fetched.uid,
            internal_date: fetched
                .internal_date()
                .map(|datetime| datetime.with_timezone(&Utc)),
            rfc822: body.to_vec(),
            ..RawMessage::default()
        };
        for flag in fetched.flags() {
            match flag {
                imap::types::Flag::Seen => raw.seen = true,
                imap::types::Flag::Flagged => raw.flagged = true,
                _ => {}
            }
        }
        messages.push(raw);
    }

    messages.sort_by(|a, b| b.uid.cmp(&a.uid));
    Ok(messages)
}

fn fetch_error(error: imap::Error) -> EmailError {
    EmailError::Fetch(format!("imap error: {error}"))
}
