//! Message body parsing

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser as MimeMessageParser, PartType};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TriageError};
use crate::models::{MessageSnapshot, RawMessage};

static SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>").unwrap());
static BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*(br|/p|/div|/tr|/li|/h[1-6])\s*/?>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static HORIZONTAL_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());

/// Parsed headers and bodies of one message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl ParsedMessage {
    /// Plain text if present, otherwise the HTML body rendered to text
    pub fn body(&self) -> String {
        match (&self.text, &self.html) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(html)) => html_to_text(html),
            (Some(text), None) => text.clone(),
            (None, None) => String::new(),
        }
    }
}

pub trait MessageParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage>;
}

/// RFC 5322 / MIME parser backed by `mail-parser`
#[derive(Debug, Default, Clone)]
pub struct MimeParser;

impl MessageParser for MimeParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMessage> {
        if raw.is_empty() {
            return Err(TriageError::Parse("Empty message source".to_string()));
        }

        let message = MimeMessageParser::default()
            .parse(raw)
            .ok_or_else(|| TriageError::Parse("Unparseable message source".to_string()))?;

        let sender = message
            .from()
            .and_then(|list| list.first())
            .map(|addr| {
                let name = addr.name.as_deref().unwrap_or("").trim();
                let address = addr.address.as_deref().unwrap_or("").trim();
                match (name.is_empty(), address.is_empty()) {
                    (false, false) => format!("{} <{}>", name, address),
                    (true, false) => address.to_string(),
                    _ => name.to_string(),
                }
            })
            .unwrap_or_default();

        let date = message
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

        // Only genuine text/plain parts count as text; HTML is rendered separately
        let text = message
            .text_body
            .first()
            .and_then(|id| message.part(*id))
            .and_then(|part| match &part.body {
                PartType::Text(text) => Some(text.to_string()),
                _ => None,
            });
        let html = message
            .html_body
            .first()
            .and_then(|id| message.part(*id))
            .and_then(|part| match &part.body {
                PartType::Html(html) => Some(html.to_string()),
                _ => None,
            });

        Ok(ParsedMessage {
            subject: message.subject().unwrap_or("").to_string(),
            sender,
            date,
            text,
            html,
        })
    }
}

/// Crude HTML rendering: drop scripts and styles, strip tags, decode common entities
pub fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(html, " ");
    let with_breaks = BLOCK_BREAK.replace_all(&without_scripts, "\n");
    let stripped = TAG.replace_all(&with_breaks, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    let collapsed = HORIZONTAL_SPACE.replace_all(&decoded, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    BLANK_LINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Combine a fetch result with its parsed content
pub fn build_snapshot(raw: RawMessage, parsed: &ParsedMessage) -> MessageSnapshot {
    let date = parsed
        .date
        .or(raw.internal_date)
        .unwrap_or_else(Utc::now);

    MessageSnapshot {
        uid: raw.uid,
        sender: parsed.sender.clone(),
        subject: parsed.subject.clone(),
        body: parsed.body(),
        date,
        flags: raw.flags,
        labels: raw.labels,
    }
}
