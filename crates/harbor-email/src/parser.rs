use crate::EmailError;
use chrono::{DateTime, TimeZone, Utc};
use harbor_core::{AccountId, MailFolder, Message};
use mailparse::{parse_mail, ParsedMail};
use uuid::Uuid;

pub const NO_SUBJECT: &str = "(no subject)";

/// One message as returned by the remote mailbox, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub uid: Option<u32>,
    pub seen: bool,
    pub flagged: bool,
    pub internal_date: Option<DateTime<Utc>>,
    pub rfc822: Vec<u8>,
}

/// Normalized message content. Cache id, owner and folder are filled in by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub received_at: DateTime<Utc>,
}

impl ParsedMessage {
    pub fn into_message(self, account_id: &AccountId, folder: MailFolder) -> Message {
        Message {
            id: Uuid::new_v4(),
            account_id: account_id.clone(),
            message_id: self.message_id,
            subject: self.subject,
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            body_text: self.body_text,
            body_html: self.body_html,
            attachments: self.attachments,
            folder,
            is_read: self.is_read,
            is_starred: self.is_starred,
            received_at: self.received_at,
        }
    }
}

pub fn parse_message(raw: &RawMessage) -> Result<ParsedMessage, EmailError> {
    if raw.rfc822.iter().all(u8::is_ascii_whitespace) {
        return Err(EmailError::Malformed("empty message body".to_string()));
    }

    let parsed = parse_mail(&raw.rfc822)?;
    if parsed.headers.is_empty() {
        return Err(EmailError::Malformed("message has no headers".to_string()));
    }

    let subject = header_value(&parsed, "Subject")
        .filter(|subject| !subject.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());
    let received_at = parsed_message_date(&parsed)
        .or(raw.internal_date)
        .unwrap_or_else(Utc::now);

    Ok(ParsedMessage {
        message_id: header_value(&parsed, "Message-ID").filter(|id| !id.is_empty()),
        subject,
        from: header_value(&parsed, "From").unwrap_or_default(),
        to: header_value(&parsed, "To").unwrap_or_default(),
        cc: header_value(&parsed, "Cc").filter(|cc| !cc.is_empty()),
        bcc: header_value(&parsed, "Bcc").filter(|bcc| !bcc.is_empty()),
        body_text: extract_text_body(&parsed).unwrap_or_default(),
        body_html: extract_html_body(&parsed).map(|html| ammonia::clean(&html)),
        attachments: attachment_names(&parsed),
        is_read: raw.seen,
        is_starred: raw.flagged,
        received_at,
    })
}

/// Parses every message of a batch, skipping (and logging) the ones that fail.
pub fn parse_batch(raws: &[RawMessage]) -> Vec<ParsedMessage> {
    raws.iter()
        .filter_map(|raw| match parse_message(raw) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::warn!(uid = ?raw.uid, error = %err, "skipping unparseable message");
                None
            }
        })
        .collect()
}

fn header_value(mail: &ParsedMail<'_>, key: &str) -> Option<String> {
    for header in mail.get_headers() {
        if header.get_key_ref().eq_ignore_ascii_case(key) {
            return Some(header.get_value().trim().to_string());
        }
    }

    None
}

fn parsed_message_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let raw = header_value(parsed, "Date")?;
    let timestamp = mailparse::dateparse(&raw).ok()?;
    Utc.timestamp_opt(timestamp, 0).single()
}

fn extract_text_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/plain" && !is_attachment(mail) {
            return mail.get_body().ok();
        }
        return None;
    }

    mail.subparts.iter().find_map(extract_text_body)
}

fn extract_html_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/html" && !is_attachment(mail) {
            return mail.get_body().ok();
        }
        return None;
    }

    mail.subparts.iter().find_map(extract_html_body)
}

fn is_attachment(mail: &ParsedMail<'_>) -> bool {
    header_value(mail, "Content-Disposition")
        .map(|disposition| disposition.to_ascii_lowercase().starts_with("attachment"))
        .unwrap_or(false)
}

fn attachment_names(mail: &ParsedMail<'_>) -> Vec<String> {
    let mut names = Vec::new();
    collect_attachment_names(mail, &mut names);
    names
}

fn collect_attachment_names(mail: &ParsedMail<'_>, names: &mut Vec<String>) {
    if mail.subparts.is_empty() {
        let disposition = header_value(mail, "Content-Disposition").unwrap_or_default();
        let name = header_filename(&disposition).or_else(|| mail.ctype.params.get("name").cloned());
        let disposition = disposition.to_ascii_lowercase();
        let listed = disposition.contains("attachment")
            || (disposition.contains("inline") && name.is_some());

        if listed {
            names.push(name.unwrap_or_else(|| "attachment.bin".to_string()));
        }
        return;
    }

    for part in &mail.subparts {
        collect_attachment_names(part, names);
    }
}

/// Reads the `filename` parameter, matching the key case-insensitively but keeping the
/// value as sent.
fn header_filename(disposition: &str) -> Option<String> {
    let key = "filename=";
    let idx = disposition.to_ascii_lowercase().find(key)?;
    let raw = disposition[idx + key.len()..].trim();

    if let Some(stripped) = raw.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }

    raw.split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
