//! Inbound receipt parsing: RFC 3464 delivery status notifications and PEC
//! (certified email) receipts.
//!
//! The parsers never fail: truncated, malformed, or non-bounce input yields
//! a result with all-null fields and the caller skips the message. Long
//! diagnostics are truncated, non-UTF-8 content is decoded lossily, and the
//! correlated message id is returned exactly as found in the
//! `X-Genro-Mail-ID` header.

use std::sync::OnceLock;

use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::Regex;

use crate::MAIL_ID_HEADER;

/// Maximum length kept from diagnostic strings.
const MAX_DIAGNOSTIC_LEN: usize = 500;

/// Bounce severity derived from the reply code class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceType {
    /// 5xx: permanent failure.
    Hard,
    /// 4xx: temporary failure.
    Soft,
}

impl BounceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BounceType::Hard => "hard",
            BounceType::Soft => "soft",
        }
    }
}

/// Result of scanning one inbound message for bounce information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BounceInfo {
    /// Correlated original message id from `X-Genro-Mail-ID`.
    pub message_id: Option<String>,
    /// True when the message looks like a bounce at all.
    pub is_bounce: bool,
    pub bounce_type: Option<BounceType>,
    /// Enhanced status (`5.1.1`) when available, else the reply code (`550`).
    pub bounce_code: Option<String>,
    pub diagnostic: Option<String>,
    pub recipient: Option<String>,
}

/// PEC receipt kinds carried in the `X-Ricevuta` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PecReceipt {
    /// `accettazione`: the provider accepted the message.
    Acceptance,
    /// `avvenuta-consegna`: delivered to the recipient's mailbox.
    Delivery,
    /// `mancata-consegna`: delivery failed.
    Failure,
    /// `non-accettazione`: the provider refused the message.
    NonAcceptance,
}

/// Result of scanning one inbound message for a PEC receipt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PecInfo {
    pub message_id: Option<String>,
    pub receipt: Option<PecReceipt>,
    pub diagnostic: Option<String>,
}

fn smtp_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([45]\d{2})\b").expect("valid code regex"))
}

fn enhanced_status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([45]\.\d{1,3}\.\d{1,3})\b").expect("valid status regex"))
}

/// Parse raw RFC 822 bytes as a bounce notification.
pub fn parse_bounce(raw: &[u8]) -> BounceInfo {
    let Some(message) = MessageParser::default().parse(raw) else {
        return BounceInfo::default();
    };

    let mut info = BounceInfo::default();

    // 1. Structured path: multipart/report with a delivery-status part.
    let mut status_body: Option<String> = None;
    for part in &message.parts {
        let Some(content_type) = part.content_type() else {
            continue;
        };
        let ctype = content_type.ctype().to_ascii_lowercase();
        let subtype = content_type
            .subtype()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if ctype == "message" && subtype == "delivery-status" {
            status_body = Some(part_text(&part.body));
        } else if ctype == "message" && (subtype == "rfc822-headers" || subtype == "rfc822") {
            if info.message_id.is_none() {
                info.message_id = match &part.body {
                    PartType::Message(nested) => header_text(nested, MAIL_ID_HEADER),
                    other => find_header_line(&part_text(other), MAIL_ID_HEADER),
                };
            }
        }
    }

    if let Some(body) = status_body {
        info.is_bounce = true;
        let fields = parse_status_fields(&body);
        info.recipient = fields.final_recipient;
        if let Some(diagnostic) = fields.diagnostic_code {
            info.bounce_code = extract_code(&diagnostic).or(fields.status.clone());
            info.diagnostic = Some(truncate(&diagnostic));
        }
        if info.bounce_code.is_none() {
            info.bounce_code = fields.status;
        }
    } else {
        // 2. Heuristics: daemon sender, failure subject, codes in the body.
        let from = message
            .from()
            .and_then(|addrs| addrs.first())
            .and_then(|addr| addr.address())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let subject = message.subject().map(str::to_ascii_lowercase).unwrap_or_default();

        let daemon_sender = from.contains("mailer-daemon") || from.contains("postmaster");
        let failure_subject = ["undeliver", "failure", "failed", "returned mail", "delivery status"]
            .iter()
            .any(|pattern| subject.contains(pattern));

        if !(daemon_sender || failure_subject) {
            return info;
        }
        info.is_bounce = true;

        let body = message.body_text(0).map(|t| t.to_string()).unwrap_or_default();
        info.bounce_code = extract_code(&body);
        info.diagnostic = message.subject().map(truncate);
        if info.message_id.is_none() {
            info.message_id = find_header_line(&body, MAIL_ID_HEADER);
        }
    }

    // The bounce mailbox may also see the correlation header top-level when
    // providers return the original verbatim.
    if info.message_id.is_none() {
        info.message_id = header_text(&message, MAIL_ID_HEADER);
    }

    info.bounce_type = info.bounce_code.as_deref().and_then(|code| {
        match code.chars().next() {
            Some('5') => Some(BounceType::Hard),
            Some('4') => Some(BounceType::Soft),
            _ => None,
        }
    });

    info
}

/// Parse raw RFC 822 bytes as a PEC receipt.
pub fn parse_pec(raw: &[u8]) -> PecInfo {
    let Some(message) = MessageParser::default().parse(raw) else {
        return PecInfo::default();
    };

    let receipt = header_text(&message, "X-Ricevuta").and_then(|value| {
        match value.trim().to_ascii_lowercase().as_str() {
            "accettazione" => Some(PecReceipt::Acceptance),
            "avvenuta-consegna" => Some(PecReceipt::Delivery),
            "mancata-consegna" => Some(PecReceipt::Failure),
            "non-accettazione" => Some(PecReceipt::NonAcceptance),
            _ => None,
        }
    });

    let mut message_id = header_text(&message, MAIL_ID_HEADER);
    if message_id.is_none() {
        // Receipts attach the original message; look inside it.
        for part in &message.parts {
            match &part.body {
                PartType::Message(nested) => {
                    message_id = header_text(nested, MAIL_ID_HEADER);
                }
                other => {
                    let is_rfc822 = part
                        .content_type()
                        .is_some_and(|ct| ct.ctype().eq_ignore_ascii_case("message"));
                    if is_rfc822 {
                        message_id = find_header_line(&part_text(other), MAIL_ID_HEADER);
                    }
                }
            }
            if message_id.is_some() {
                break;
            }
        }
    }

    let diagnostic = match receipt {
        Some(PecReceipt::Failure) | Some(PecReceipt::NonAcceptance) => message
            .body_text(0)
            .map(|body| truncate(body.trim()))
            .filter(|body| !body.is_empty())
            .or_else(|| message.subject().map(truncate)),
        _ => None,
    };

    PecInfo {
        message_id,
        receipt,
        diagnostic,
    }
}

#[derive(Default)]
struct StatusFields {
    final_recipient: Option<String>,
    status: Option<String>,
    diagnostic_code: Option<String>,
}

/// Parse the per-recipient fields of a delivery-status body, unfolding
/// continuation lines.
fn parse_status_fields(body: &str) -> StatusFields {
    let mut unfolded: Vec<String> = Vec::new();
    for line in body.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = unfolded.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        unfolded.push(line.to_string());
    }

    let mut fields = StatusFields::default();
    for line in &unfolded {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "final-recipient" => {
                // "rfc822; user@example.com"
                let address = value.rsplit(';').next().unwrap_or(value).trim();
                fields.final_recipient = Some(address.to_string());
            }
            "status" => fields.status = Some(value.to_string()),
            "diagnostic-code" => fields.diagnostic_code = Some(value.to_string()),
            _ => {}
        }
    }
    fields
}

/// Prefer the enhanced status over the plain reply code.
fn extract_code(text: &str) -> Option<String> {
    if let Some(captures) = enhanced_status_re().captures(text) {
        return Some(captures[1].to_string());
    }
    smtp_code_re()
        .captures(text)
        .map(|captures| captures[1].to_string())
}

fn header_text(message: &mail_parser::Message<'_>, name: &str) -> Option<String> {
    message
        .header(name)
        .and_then(|value| value.as_text())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Scan header-shaped text for `Name: value`; the name comparison is
/// case-insensitive, the value is returned verbatim.
fn find_header_line(text: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    text.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        lower
            .starts_with(&prefix)
            .then(|| line[prefix.len()..].trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn part_text(body: &PartType<'_>) -> String {
    match body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        _ => String::new(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_DIAGNOSTIC_LEN {
        return text.to_string();
    }
    text.chars().take(MAX_DIAGNOSTIC_LEN).collect()
}
