//! Decode raw fetch results into [`CanonicalMessage`] records
//!
//! Normalization never fails. A header that cannot be decoded becomes a
//! marked placeholder and an unparseable date becomes `None`, so one
//! malformed header never discards an otherwise valid message.

use chrono::{DateTime, Utc};
use log::warn;
use mailparse::{MailAddr, MailHeader, MailHeaderMap};

use super::RawRecord;
use crate::models::CanonicalMessage;

/// Placeholder for a subject that could not be decoded
pub const SUBJECT_PLACEHOLDER: &str = "(Subject decode error)";
/// Placeholder for a sender that could not be decoded
pub const SENDER_PLACEHOLDER: &str = "(From address decode error)";

/// Maximum characters kept in `raw_preview`
const PREVIEW_CHARS: usize = 200;

/// Build the canonical view of a fetched message
pub fn normalize(mailbox: &str, record: &RawRecord) -> CanonicalMessage {
    let mut message = CanonicalMessage::new(record.uid, mailbox);
    message.flags = record.flags.clone();
    message.size_bytes = record.size;

    let headers = match mailparse::parse_headers(&record.content) {
        Ok((headers, _)) => headers,
        Err(e) => {
            warn!("UID {} in {}: unparseable header block: {}", record.uid, mailbox, e);
            message.subject = SUBJECT_PLACEHOLDER.to_string();
            message.sender = SENDER_PLACEHOLDER.to_string();
            return message;
        }
    };

    message.subject = decoded(&headers, "Subject", SUBJECT_PLACEHOLDER, record, mailbox);
    message.sender = decoded(&headers, "From", SENDER_PLACEHOLDER, record, mailbox);
    message.recipients = recipients(&headers);
    message.date = headers.get_first_value("Date").as_deref().and_then(parse_date);
    message.message_id = headers
        .get_first_value("Message-ID")
        .and_then(|v| id_tokens(&v).into_iter().next());
    message.references = headers
        .get_first_value("References")
        .map(|v| id_tokens(&v))
        .unwrap_or_default();
    message.in_reply_to = headers
        .get_first_value("In-Reply-To")
        .and_then(|v| id_tokens(&v).into_iter().next());
    message.raw_preview = preview(&record.content).unwrap_or_else(|| message.subject.clone());

    message
}

/// Decode a header with RFC 2047 support, falling back to a placeholder
fn decoded(
    headers: &[MailHeader<'_>],
    name: &str,
    placeholder: &str,
    record: &RawRecord,
    mailbox: &str,
) -> String {
    let Some(header) = headers.get_first_header(name) else {
        return String::new();
    };
    match header.get_value_utf8() {
        Ok(value) if !value.contains('\u{FFFD}') => value.trim().to_string(),
        Ok(_) | Err(_) => {
            warn!("UID {} in {}: could not decode {} header", record.uid, mailbox, name);
            placeholder.to_string()
        }
    }
}

fn recipients(headers: &[MailHeader<'_>]) -> Vec<String> {
    let mut out = Vec::new();
    for header in headers
        .iter()
        .filter(|h| h.get_key_ref().eq_ignore_ascii_case("To") || h.get_key_ref().eq_ignore_ascii_case("Cc"))
    {
        let Ok(list) = mailparse::addrparse_header(header) else {
            continue;
        };
        for addr in list.iter() {
            match addr {
                MailAddr::Single(single) => out.push(single.addr.clone()),
                MailAddr::Group(group) => out.extend(group.addrs.iter().map(|s| s.addr.clone())),
            }
        }
    }
    out
}

/// Parse an RFC 2822 date; `None` rather than a placeholder time on failure
///
/// `dateparse` is lenient and reports garbage as the epoch, so it is only
/// trusted for inputs chrono's strict parser rejects and only when it
/// produced a non-zero timestamp.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    match mailparse::dateparse(raw) {
        Ok(secs) if secs != 0 => DateTime::from_timestamp(secs, 0),
        _ => None,
    }
}

/// Extract `<...>` message identifiers, falling back to whitespace tokens
pub fn id_tokens(value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let token = &rest[start..start + len + 1];
        if token.len() > 2 {
            tokens.push(token.to_string());
        }
        rest = &rest[start + len + 1..];
    }
    if tokens.is_empty() {
        tokens = value.split_whitespace().map(str::to_string).collect();
    }
    tokens
}

/// First characters of the body text, if the record carries a body
fn preview(content: &[u8]) -> Option<String> {
    let parsed = mailparse::parse_mail(content).ok()?;
    let text = body_text(&parsed)?;
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(PREVIEW_CHARS).collect())
}

/// Decoded text of the first `text/plain` part, else the top-level body
pub(crate) fn body_text(parsed: &mailparse::ParsedMail<'_>) -> Option<String> {
    if parsed.subparts.is_empty() {
        return parsed.get_body().ok();
    }
    parsed
        .subparts
        .iter()
        .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("text/plain"))
        .and_then(|part| part.get_body().ok())
        .or_else(|| parsed.subparts.iter().find_map(body_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Uid;
    use std::collections::BTreeSet;

    fn record(raw: &str) -> RawRecord {
        RawRecord {
            uid: Uid(42),
            flags: BTreeSet::from(["\\Seen".to_string()]),
            size: raw.len() as u64,
            content: raw.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_normalize_headers() {
        let raw = "Subject: =?UTF-8?B?SGVsbG8gV29ybGQ=?=\r\n\
                   From: Alice <alice@example.com>\r\n\
                   To: bob@example.com, Carol <carol@example.com>\r\n\
                   Cc: dave@example.com\r\n\
                   Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
                   Message-ID: <c@x>\r\n\
                   References: <a@x> <b@x>\r\n\
                   In-Reply-To: <b@x>\r\n\r\n";
        let msg = normalize("INBOX", &record(raw));

        assert_eq!(msg.identifier, Uid(42));
        assert_eq!(msg.subject, "Hello World");
        assert_eq!(msg.sender, "Alice <alice@example.com>");
        assert_eq!(
            msg.recipients,
            vec!["bob@example.com", "carol@example.com", "dave@example.com"]
        );
        assert_eq!(msg.date.map(|d| d.timestamp()), Some(1057049557));
        assert_eq!(msg.message_id.as_deref(), Some("<c@x>"));
        assert_eq!(msg.references, vec!["<a@x>", "<b@x>"]);
        assert_eq!(msg.in_reply_to.as_deref(), Some("<b@x>"));
        assert!(msg.is_seen());
    }

    #[test]
    fn test_bad_date_is_none() {
        let raw = "Subject: hi\r\nDate: not a date at all\r\n\r\n";
        let msg = normalize("INBOX", &record(raw));
        assert_eq!(msg.date, None);
        assert_eq!(msg.subject, "hi");
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        for raw in ["not a date at all", "garbage", "", "Mon"] {
            assert_eq!(parse_date(raw), None, "{:?}", raw);
        }
    }

    #[test]
    fn test_parse_date_accepts_mail_dates() {
        let strict = parse_date("Mon, 4 Mar 2024 09:00:00 +0100").unwrap();
        assert_eq!(strict.to_rfc3339(), "2024-03-04T08:00:00+00:00");

        // Missing weekday and named zone still go through the lenient parser
        let lenient = parse_date("4 Mar 2024 09:00:00 GMT").unwrap();
        assert_eq!(lenient.to_rfc3339(), "2024-03-04T09:00:00+00:00");
    }

    #[test]
    fn test_undecodable_subject_uses_placeholder() {
        let mut rec = record("");
        rec.content = b"Subject: caf\xe9 \xff\xfe\r\nFrom: a@example.com\r\n\r\n".to_vec();
        let msg = normalize("INBOX", &rec);
        assert_eq!(msg.subject, SUBJECT_PLACEHOLDER);
        assert_eq!(msg.sender, "a@example.com");
    }

    #[test]
    fn test_preview_from_body() {
        let raw = "Subject: s\r\nContent-Type: text/plain\r\n\r\nFirst line\r\n  second line\r\n";
        let msg = normalize("INBOX", &record(raw));
        assert_eq!(msg.raw_preview, "First line second line");
    }

    #[test]
    fn test_id_tokens_fallback() {
        assert_eq!(id_tokens("<a@x>\r\n <b@x>"), vec!["<a@x>", "<b@x>"]);
        assert_eq!(id_tokens("bare-id@x"), vec!["bare-id@x"]);
        assert!(id_tokens("   ").is_empty());
    }
}
