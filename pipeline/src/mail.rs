//! Envelope and attachment parsing for archived `.eml` items.

use anyhow::Context;
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;

use lib_field_extract::EmailMeta;

lazy_static::lazy_static!(
    static ref RE_WHITESPACE: Regex = Regex::new(r"[\r\t\n]+").unwrap();
    static ref RE_LONG_SPACE: Regex = Regex::new(r" {2,}").unwrap();
    static ref RE_DIVIDERS: Regex = Regex::new(r"[-=_]{3,}").unwrap();
    static ref RE_HTTP_LINK: Regex = Regex::new(r"https?://(www\.)?[-a-zA-Z0-9@:%._\+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b([-a-zA-Z0-9()@:%_\+.~#?&/=]*)").unwrap();
);

#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub body: String,
}

impl Envelope {
    pub fn meta(&self) -> EmailMeta {
        EmailMeta {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: self.subject.clone(),
            date: self.date.clone(),
        }
    }

    /// Sender address without display name, for notification matching.
    pub fn sender_address(&self) -> &str {
        match (self.from.find('<'), self.from.find('>')) {
            (Some(start), Some(end)) if start < end => self.from[start + 1..end].trim(),
            _ => self.from.trim(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedItem {
    pub envelope: Envelope,
    pub attachments: Vec<MailAttachment>,
}

/// Parse a raw `.eml`, preferring the plain-text body and falling back to
/// stripped HTML. Inline parts are not treated as attachments.
pub fn parse_eml(raw: &[u8]) -> anyhow::Result<ParsedItem> {
    let msg = MessageParser::default()
        .parse(raw)
        .context("unparseable message")?;

    let from = address_header(msg.from());
    let to = address_header(msg.to());
    let subject = msg.subject().unwrap_or_default().to_string();
    let date = msg.date().map(|d| d.to_rfc3339()).unwrap_or_default();

    let body = match msg.body_text(0) {
        Some(text) => scrub(&text),
        None => msg
            .body_html(0)
            .map(|html| scrub(&html2text::from_read(html.as_bytes(), 400)))
            .unwrap_or_default(),
    };

    let mut attachments = Vec::new();
    for part in msg.attachments() {
        let Some(filename) = part.attachment_name() else {
            continue;
        };
        attachments.push(MailAttachment {
            filename: filename.to_string(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            data: part.contents().to_vec(),
        });
    }

    Ok(ParsedItem {
        envelope: Envelope {
            from,
            to,
            subject: scrub(&subject),
            date,
            body,
        },
        attachments,
    })
}

fn address_header(addr: Option<&mail_parser::Address>) -> String {
    addr.and_then(|a| a.first())
        .map(|a| {
            let email = a.address().map(|e| e.to_string()).unwrap_or_default();
            match a.name() {
                Some(name) if !name.trim().is_empty() => format!("{} <{}>", name.trim(), email),
                _ => email,
            }
        })
        .unwrap_or_default()
}

/// Collapse the noise OCR and classification do not care about: links,
/// dividers, runs of whitespace.
pub fn scrub(text: &str) -> String {
    let t = RE_HTTP_LINK.replace_all(text, "[LINK]");
    let t = RE_WHITESPACE.replace_all(&t, " ");
    let t = RE_DIVIDERS.replace_all(&t, " ");
    let t = RE_LONG_SPACE.replace_all(&t, " ");
    t.trim().to_string()
}
