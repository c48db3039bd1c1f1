//! Parsing raw RFC 822 messages into what the pipeline needs.

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};

use super::{
    IngestError,
    text::{normalize_body, normalize_subject},
};

const SYNTHETIC_ID_DOMAIN: &str = "foxdesk.invalid";
const HTML_WRAP_WIDTH: usize = 100;

#[derive(Debug, Clone)]
pub struct InboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Message-ID including angle brackets; synthetic when the header was missing.
    pub message_id: String,
    pub synthetic_message_id: bool,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    /// Lower-cased sender address.
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: String,
    pub auto_submitted: bool,
    pub body: String,
    pub attachments: Vec<InboundAttachment>,
}

impl InboundMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, IngestError> {
        let parsed = mailparse::parse_mail(raw).map_err(|e| IngestError::Parse(e.to_string()))?;
        let headers = parsed.get_headers();

        let (message_id, synthetic_message_id) = match headers.get_first_value("Message-ID").and_then(|v| message_ids(&v).into_iter().next()) {
            Some(id) => (id, false),
            None => (synthetic_message_id(raw), true),
        };

        let (from_email, from_name) = headers
            .get_first_header("From")
            .and_then(|h| mailparse::addrparse_header(h).ok())
            .and_then(|list| list.extract_single_info())
            .map(|info| (Some(info.addr.trim().to_lowercase()), info.display_name.filter(|n| !n.trim().is_empty())))
            .unwrap_or((None, None));

        let mut walker = PartWalker::default();
        walker.walk(&parsed)?;

        Ok(Self {
            message_id,
            synthetic_message_id,
            in_reply_to: headers.get_first_value("In-Reply-To").map(|v| message_ids(&v)).unwrap_or_default(),
            references: headers.get_first_value("References").map(|v| message_ids(&v)).unwrap_or_default(),
            from_email: from_email.filter(|e| e.contains('@')),
            from_name,
            subject: normalize_subject(&headers.get_first_value("Subject").unwrap_or_default()),
            auto_submitted: is_auto_submitted(&parsed),
            body: walker.body(),
            attachments: walker.attachments,
        })
    }

    /// Every Message-ID this message claims to answer, most specific first.
    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.in_reply_to.iter().chain(self.references.iter().rev()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// `<sha256-of-raw>@foxdesk.invalid`, stable for the same bytes so re-ingest still dedupes.
pub fn synthetic_message_id(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("<{hex}@{SYNTHETIC_ID_DOMAIN}>")
}

/// Angle-bracketed ids from a Message-ID, In-Reply-To or References header value. A bare id
/// without brackets is accepted when it is the whole value.
fn message_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let inner = rest[start + 1..start + len].trim();
        if !inner.is_empty() && !inner.contains(char::is_whitespace) {
            ids.push(format!("<{inner}>"));
        }
        rest = &rest[start + len + 1..];
    }

    let bare = value.trim();
    if ids.is_empty() && bare.contains('@') && !bare.contains(char::is_whitespace) && !bare.contains(['<', '>']) {
        ids.push(format!("<{bare}>"));
    }
    ids
}

fn is_auto_submitted(parsed: &ParsedMail<'_>) -> bool {
    let headers = parsed.get_headers();
    let auto_submitted = headers
        .get_first_value("Auto-Submitted")
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_lowercase())
        .is_some_and(|v| !v.is_empty() && v != "no");
    let bulk = headers
        .get_first_value("Precedence")
        .map(|v| v.trim().to_lowercase())
        .is_some_and(|v| matches!(v.as_str(), "bulk" | "junk" | "list" | "auto_reply"));
    let autoreply = headers.get_first_header("X-Autoreply").is_some() || headers.get_first_header("X-Autorespond").is_some();
    auto_submitted || bulk || autoreply
}

#[derive(Default)]
struct PartWalker {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<InboundAttachment>,
}

impl PartWalker {
    fn walk(&mut self, part: &ParsedMail<'_>) -> Result<(), IngestError> {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.walk(sub)?;
            }
            return Ok(());
        }

        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let is_attachment = disposition.disposition == DispositionType::Attachment || filename.is_some() || mimetype == "message/rfc822";
        if is_attachment {
            let content = part.get_body_raw().map_err(|e| IngestError::Parse(format!("attachment body: {e}")))?;
            let filename = filename.unwrap_or_else(|| fallback_filename(&mimetype, self.attachments.len() + 1));
            self.attachments.push(InboundAttachment {
                filename,
                content_type: mimetype,
                content,
            });
            return Ok(());
        }

        match mimetype.as_str() {
            "text/plain" if self.text.is_none() => {
                self.text = Some(part.get_body().map_err(|e| IngestError::Parse(format!("text body: {e}")))?);
            }
            "text/html" if self.html.is_none() => {
                self.html = Some(part.get_body().map_err(|e| IngestError::Parse(format!("html body: {e}")))?);
            }
            _ => {}
        }
        Ok(())
    }

    fn body(&self) -> String {
        match (&self.text, &self.html) {
            (Some(text), _) if !text.trim().is_empty() => normalize_body(text),
            (_, Some(html)) => normalize_body(&html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH)),
            (Some(text), None) => normalize_body(text),
            (None, None) => String::new(),
        }
    }
}

fn fallback_filename(mimetype: &str, index: usize) -> String {
    if mimetype == "message/rfc822" {
        return format!("message-{index}.eml");
    }
    let extension = mime_guess::get_mime_extensions_str(mimetype)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin");
    format!("attachment-{index}.{extension}")
}
