//! RFC 5322 (.eml) parsing and a directory-backed mail source.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::types::{InboundEmail, MailSource};

/// Parse a raw RFC 5322 message.
///
/// `fallback_id` becomes the transport id when the message has no Message-ID.
pub fn parse_eml(raw: &[u8], fallback_id: &str) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let transport_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| fallback_id.to_string());

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut headers = BTreeMap::new();
    for header in parsed.headers() {
        if let Some(value) = header.value().as_text() {
            headers.insert(header.name().to_string(), value.to_string());
        }
    }

    Some(InboundEmail {
        transport_id,
        conversation_id: parsed.in_reply_to().as_text().map(|s| s.to_string()),
        received_at,
        from: format_address(parsed.from()),
        to: format_address(parsed.to()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        body_text: parsed.body_text(0).map(|t| t.to_string()),
        body_html: parsed.body_html(0).map(|h| h.to_string()),
        headers,
    })
}

/// Render the first address as `Name <addr>` (or just the address).
fn format_address(addr: Option<&mail_parser::Address>) -> String {
    let Some(first) = addr.and_then(|a| a.first()) else {
        return String::new();
    };
    match (first.name(), first.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Reads every `*.eml` file in a directory.
pub struct MailDirSource {
    dir: PathBuf,
}

impl MailDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl MailSource for MailDirSource {
    fn name(&self) -> &str {
        "maildir"
    }

    async fn fetch(&self, _user_id: &str) -> Result<Vec<InboundEmail>, PipelineError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            PipelineError::Fetch(format!("cannot read {}: {e}", self.dir.display()))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::Fetch(format!("read_dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("eml")) {
                paths.push(path);
            }
        }
        // Stable processing order across runs
        paths.sort();

        let mut emails = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable mail file");
                    continue;
                }
            };
            let fallback_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match parse_eml(&raw, &fallback_id) {
                Some(email) => emails.push(email),
                None => warn!(path = %path.display(), "Skipping unparsable mail file"),
            }
        }

        debug!(count = emails.len(), dir = %self.dir.display(), "Loaded mail files");
        Ok(emails)
    }
}
