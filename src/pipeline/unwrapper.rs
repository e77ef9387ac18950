//! Forward unwrapping. Recovers the original sender, subject, date and body
//! of an email the user forwarded into the tracker.
//!
//! Forwarding clients wrap the original in a banner and a pseudo-header block.
//! Detection runs on HTML first (rendered to text) and falls back to the plain
//! text part. A non-forwarded email passes through unchanged with confidence 1.0.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mail::html_to_text;
use crate::pipeline::dates::parse_email_date;

const WEIGHT_FROM: f64 = 0.35;
const WEIGHT_SUBJECT: f64 = 0.25;
const WEIGHT_DATE: f64 = 0.20;
const WEIGHT_BODY: f64 = 0.20;

/// HTML results at or below this confidence give the text part a chance.
const HTML_ACCEPT_CONFIDENCE: f64 = 0.6;

/// Which path produced an `UnwrapResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwrapMethod {
    /// No forward banner or header block was found.
    NoForwardingDetected,
    GmailHtml,
    GmailText,
    OutlookHtml,
    OutlookText,
}

impl UnwrapMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoForwardingDetected => "no_forwarding_detected",
            Self::GmailHtml => "gmail_html",
            Self::GmailText => "gmail_text",
            Self::OutlookHtml => "outlook_html",
            Self::OutlookText => "outlook_text",
        }
    }
}

impl std::fmt::Display for UnwrapMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconstructed original message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwrapResult {
    pub original_from: Option<String>,
    pub original_to: Option<String>,
    pub original_subject: Option<String>,
    pub original_date: Option<DateTime<Utc>>,
    pub clean_body_text: Option<String>,
    pub confidence: f64,
    pub method: UnwrapMethod,
}

impl UnwrapResult {
    /// Pass-through result for an email that was not forwarded.
    fn passthrough(body_text: Option<&str>) -> Self {
        Self {
            original_from: None,
            original_to: None,
            original_subject: None,
            original_date: None,
            clean_body_text: body_text.map(|s| s.to_string()),
            confidence: 1.0,
            method: UnwrapMethod::NoForwardingDetected,
        }
    }

    /// A marker was found but the forwarded region could not be read.
    fn degraded(body_text: Option<&str>) -> Self {
        Self {
            confidence: 0.0,
            ..Self::passthrough(body_text)
        }
    }

    pub fn is_forward(&self) -> bool {
        self.method != UnwrapMethod::NoForwardingDetected
    }
}

/// Why a detected forward could not be read.
#[derive(Debug, thiserror::Error)]
enum UnwrapError {
    #[error("HTML body has no readable text")]
    EmptyHtml,
    #[error("forwarded region is empty")]
    EmptyRegion,
}

// ── Patterns ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStyle {
    Gmail,
    Outlook,
}

/// A forward marker and where the forwarded region starts relative to it.
struct ForwardMarker {
    style: ClientStyle,
    pattern: Regex,
    /// Header-block markers are part of the forwarded region; banners are not.
    region_includes_marker: bool,
}

static FORWARD_MARKERS: LazyLock<Vec<ForwardMarker>> = LazyLock::new(|| {
    let marker = |style, pattern: &str, region_includes_marker| ForwardMarker {
        style,
        pattern: Regex::new(pattern).expect("valid regex"),
        region_includes_marker,
    };
    vec![
        marker(ClientStyle::Gmail, r"(?i)-{5,}\s*Forwarded message\s*-{5,}", false),
        marker(ClientStyle::Gmail, r"(?i)Begin forwarded message:", false),
        marker(ClientStyle::Gmail, r"(?i)Forwarded message", false),
        marker(
            ClientStyle::Outlook,
            r"(?im)^[ \t]*From:[^\n]*\n[ \t]*Sent:[^\n]*\n(?:[ \t]*(?:To|Cc):[^\n]*\n)+[ \t]*Subject:",
            true,
        ),
        marker(ClientStyle::Outlook, r"_{32}", false),
    ]
});

/// Ordered capture patterns per header field; the first that matches wins.
static FROM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?im)From:[ \t]*(.+?)[ \t]*(?:<br\s*/?>|$)",
        r"(?im)From:\s*<([^>]+)>",
        r"(?im)From:\s*(.+?)\s*<",
    ])
});

static TO_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?im)^[ \t]*To:[ \t]*(.+?)[ \t]*(?:<br\s*/?>|$)",
        r"(?im)To:\s*<([^>]+)>",
    ])
});

static SUBJECT_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_all(&[r"(?im)Subject:[ \t]*(.+?)[ \t]*(?:<br\s*/?>|$)"]));

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?im)Date:[ \t]*(.+?)[ \t]*(?:<br\s*/?>|$)",
        r"(?im)Sent:[ \t]*(.+?)[ \t]*(?:<br\s*/?>|$)",
    ])
});

/// Header lines whose end bounds the pseudo-header block.
static HEADER_LINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?im)^[ \t]*From:[^\n]*(?:\n|\z)",
        r"(?im)^[ \t]*To:[^\n]*(?:\n|\z)",
        r"(?im)^[ \t]*Subject:[^\n]*(?:\n|\z)",
        r"(?im)^[ \t]*Date:[^\n]*(?:\n|\z)",
        r"(?im)^[ \t]*Sent:[^\n]*(?:\n|\z)",
    ])
});

/// Signature and footer openers. The body is cut at the earliest one.
static SIGNATURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"\n--[ \t]*\n",
        r"\nBest regards,?[ \t]*\n",
        r"\nThanks,?[ \t]*\n",
        r"\nRegards,?[ \t]*\n",
        r"\nSent from my iPhone",
        r"\nSent from my Android",
        r"\nGet Outlook for iOS",
    ])
});

/// Quoted reply history markers.
static QUOTE_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_all(&[r"On [^\n]+? wrote:", r">\s*>"]));

/// HTML tags left inside header values. Angle-bracketed addresses contain '@' and survive.
static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>@]*>").expect("valid regex"));

static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
}

// ── Unwrapper ───────────────────────────────────────────────────────

/// Stateless forward unwrapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unwrapper;

impl Unwrapper {
    pub fn new() -> Self {
        Self
    }

    /// Unwrap an email. Always returns a well-formed result.
    pub fn unwrap(&self, body_text: Option<&str>, body_html: Option<&str>) -> UnwrapResult {
        let mut html_result = None;
        let mut html_failed = false;

        if let Some(html) = body_html.filter(|h| !h.trim().is_empty()) {
            let result = html_to_text(html)
                .ok_or(UnwrapError::EmptyHtml)
                .and_then(|text| self.unwrap_text(&text, true));
            match result {
                Ok(Some(result)) if result.confidence > HTML_ACCEPT_CONFIDENCE => {
                    debug!(method = %result.method, confidence = result.confidence, "Unwrapped HTML forward");
                    return result;
                }
                Ok(found) => html_result = found,
                Err(e) => {
                    debug!(error = %e, "HTML unwrap failed");
                    html_failed = true;
                }
            }
        }

        if let Some(text) = body_text.filter(|t| !t.trim().is_empty()) {
            match self.unwrap_text(text, false) {
                Ok(Some(result)) if result.confidence > 0.0 => {
                    debug!(method = %result.method, confidence = result.confidence, "Unwrapped text forward");
                    return result;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Text unwrap failed");
                    return UnwrapResult::degraded(body_text);
                }
            }
        }

        match html_result {
            Some(result) if result.confidence > 0.0 => result,
            _ if html_failed => UnwrapResult::degraded(body_text),
            _ => UnwrapResult::passthrough(body_text),
        }
    }

    /// Look for a forward marker in `content`. `Ok(None)` means not forwarded.
    fn unwrap_text(&self, content: &str, from_html: bool) -> Result<Option<UnwrapResult>, UnwrapError> {
        let content = content.replace("\r\n", "\n");

        let Some((marker, found)) = FORWARD_MARKERS
            .iter()
            .find_map(|m| m.pattern.find(&content).map(|found| (m, found)))
        else {
            return Ok(None);
        };

        let start = if marker.region_includes_marker {
            found.start()
        } else {
            found.end()
        };
        let region = content[start..].trim();
        if region.is_empty() {
            return Err(UnwrapError::EmptyRegion);
        }

        let original_from = capture_header(region, &FROM_PATTERNS);
        let original_to = capture_header(region, &TO_PATTERNS);
        let original_subject = capture_header(region, &SUBJECT_PATTERNS);
        let original_date = capture_header(region, &DATE_PATTERNS).and_then(|d| parse_email_date(&d));
        let clean_body_text = clean_body(region);

        let confidence = score(
            original_from.as_deref(),
            original_subject.as_deref(),
            original_date.is_some(),
            clean_body_text.as_deref(),
        );

        let method = match (marker.style, from_html) {
            (ClientStyle::Gmail, true) => UnwrapMethod::GmailHtml,
            (ClientStyle::Gmail, false) => UnwrapMethod::GmailText,
            (ClientStyle::Outlook, true) => UnwrapMethod::OutlookHtml,
            (ClientStyle::Outlook, false) => UnwrapMethod::OutlookText,
        };

        Ok(Some(UnwrapResult {
            original_from,
            original_to,
            original_subject,
            original_date,
            clean_body_text,
            confidence,
            method,
        }))
    }
}

/// First capture of the first matching pattern, with markup stripped.
fn capture_header(region: &str, patterns: &[Regex]) -> Option<String> {
    patterns.iter().find_map(|re| {
        let value = re.captures(region)?.get(1)?.as_str();
        let value = MARKUP_RE.replace_all(value, "");
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Strip the pseudo-header block, signature and quoted history from the region.
fn clean_body(region: &str) -> Option<String> {
    let header_end = HEADER_LINE_PATTERNS
        .iter()
        .filter_map(|re| re.find(region).map(|m| m.end()))
        .max()
        .unwrap_or(0);
    let mut body = region[header_end..].trim().to_string();

    let cut = SIGNATURE_PATTERNS
        .iter()
        .chain(QUOTE_PATTERNS.iter())
        .filter_map(|re| re.find(&body).map(|m| m.start()))
        .min();
    if let Some(cut) = cut {
        body.truncate(cut);
    }

    let body = BLANK_RUN_RE.replace_all(&body, "\n\n");
    let body = body.trim();
    (!body.is_empty()).then(|| body.to_string())
}

/// Additive confidence. Each recovered field only ever adds weight.
fn score(from: Option<&str>, subject: Option<&str>, has_date: bool, body: Option<&str>) -> f64 {
    let mut confidence = 0.0;
    if from.is_some_and(|f| f.contains('@')) {
        confidence += WEIGHT_FROM;
    }
    if subject.is_some_and(|s| s.chars().count() > 3) {
        confidence += WEIGHT_SUBJECT;
    }
    if has_date {
        confidence += WEIGHT_DATE;
    }
    if body.is_some_and(|b| b.chars().count() > 50) {
        confidence += WEIGHT_BODY;
    }
    f64::min(confidence, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GMAIL_FORWARD: &str = "FYI\n\n\
        ---------- Forwarded message ---------\n\
        From: Workday Recruiting <no-reply@myworkdaysite.com>\n\
        Date: Mon, Jan 15, 2024 at 10:30 AM\n\
        Subject: Thank you for applying to Acme Corp\n\
        To: <candidate@example.com>\n\
        \n\
        Thank you for your interest in the Senior Data Analyst position at Acme Corp. \
        We have received your application and will be in touch.\n\
        \n\
        Best regards,\n\
        Acme Talent Team\n";

    const OUTLOOK_FORWARD: &str = "See below.\n\n\
        From: Globex Talent <talent@globex.com>\n\
        Sent: Wednesday, January 17, 2024 3:45 PM\n\
        To: Candidate <candidate@example.com>\n\
        Subject: Interview invitation - Platform Engineer\n\
        \n\
        We would like to invite you to interview for the Platform Engineer role. \
        Please select a time that works for you.\n\
        \n\
        Thanks,\n\
        Globex\n";

    #[test]
    fn gmail_text_forward_recovers_headers() {
        let result = Unwrapper::new().unwrap(Some(GMAIL_FORWARD), None);
        assert_eq!(result.method, UnwrapMethod::GmailText);
        assert_eq!(
            result.original_from.as_deref(),
            Some("Workday Recruiting <no-reply@myworkdaysite.com>")
        );
        assert_eq!(
            result.original_subject.as_deref(),
            Some("Thank you for applying to Acme Corp")
        );
        assert_eq!(result.original_to.as_deref(), Some("<candidate@example.com>"));
        assert_eq!(
            result.original_date.unwrap().format("%Y-%m-%d %H:%M").to_string(),
            "2024-01-15 10:30"
        );
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gmail_body_loses_headers_and_signature() {
        let result = Unwrapper::new().unwrap(Some(GMAIL_FORWARD), None);
        let body = result.clean_body_text.unwrap();
        assert!(body.starts_with("Thank you for your interest"));
        assert!(!body.contains("Subject:"));
        assert!(!body.contains("Best regards"));
        assert!(!body.contains("Acme Talent Team"));
    }

    #[test]
    fn outlook_header_block_is_detected() {
        let result = Unwrapper::new().unwrap(Some(OUTLOOK_FORWARD), None);
        assert_eq!(result.method, UnwrapMethod::OutlookText);
        assert_eq!(
            result.original_from.as_deref(),
            Some("Globex Talent <talent@globex.com>")
        );
        assert_eq!(
            result.original_subject.as_deref(),
            Some("Interview invitation - Platform Engineer")
        );
        assert_eq!(
            result.original_date.unwrap().format("%Y-%m-%d %H:%M").to_string(),
            "2024-01-17 15:45"
        );
        let body = result.clean_body_text.unwrap();
        assert!(body.starts_with("We would like to invite you"));
        assert!(!body.contains("Thanks,"));
    }

    #[test]
    fn html_forward_is_preferred() {
        let html = "<div>FYI</div><div>---------- Forwarded message ---------</div>\
            <div>From: Acme Jobs &lt;jobs@acme.com&gt;</div>\
            <div>Date: Mon, Jan 15, 2024 at 10:30 AM</div>\
            <div>Subject: Your application to Acme</div>\
            <div>To: me@example.com</div>\
            <p>Thanks for applying to the Backend Engineer role. Our team is reviewing your profile now.</p>";
        let result = Unwrapper::new().unwrap(Some("plain fallback"), Some(html));
        assert_eq!(result.method, UnwrapMethod::GmailHtml);
        assert_eq!(result.original_from.as_deref(), Some("Acme Jobs <jobs@acme.com>"));
        assert!(result.confidence > HTML_ACCEPT_CONFIDENCE);
    }

    #[test]
    fn weak_html_falls_back_to_text() {
        // HTML has the banner but nothing else recoverable.
        let html = "<p>---------- Forwarded message ---------</p><p>see text part</p>";
        let result = Unwrapper::new().unwrap(Some(GMAIL_FORWARD), Some(html));
        assert_eq!(result.method, UnwrapMethod::GmailText);
    }

    #[test]
    fn non_forwarded_passes_through() {
        let body = "Hi, thanks for applying to Initech. We'll be in touch.";
        let result = Unwrapper::new().unwrap(Some(body), None);
        assert_eq!(result.method, UnwrapMethod::NoForwardingDetected);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.clean_body_text.as_deref(), Some(body));
        assert!(result.original_from.is_none());
        assert!(!result.is_forward());
    }

    #[test]
    fn empty_input_passes_through() {
        let result = Unwrapper::new().unwrap(None, None);
        assert_eq!(result.method, UnwrapMethod::NoForwardingDetected);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn unreadable_html_with_no_text_degrades_to_zero() {
        let result = Unwrapper::new().unwrap(None, Some("<div>   </div>"));
        assert_eq!(result.method, UnwrapMethod::NoForwardingDetected);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn quoted_history_is_cut() {
        let text = "---------- Forwarded message ---------\n\
            From: a@b.com\n\
            Subject: Application update\n\
            \n\
            Your application moved forward to the next round of our process, congratulations.\n\
            On Mon, Jan 1, 2024 at 9:00 AM Someone <x@y.com> wrote:\n\
            > old stuff\n";
        let result = Unwrapper::new().unwrap(Some(text), None);
        let body = result.clean_body_text.unwrap();
        assert!(body.ends_with("congratulations."));
    }

    #[test]
    fn confidence_is_monotonic_in_recovered_fields() {
        let base = score(None, None, false, None);
        let with_from = score(Some("a@b.com"), None, false, None);
        let with_subject = score(Some("a@b.com"), Some("Hello there"), false, None);
        let with_date = score(Some("a@b.com"), Some("Hello there"), true, None);
        let full = score(Some("a@b.com"), Some("Hello there"), true, Some(&"x".repeat(60)));
        assert!(base <= with_from && with_from <= with_subject);
        assert!(with_subject <= with_date && with_date <= full);
        assert!((with_from - 0.35).abs() < 1e-9);
        assert!((full - 1.0).abs() < 1e-9);
        // A from without an address adds nothing.
        assert_eq!(score(Some("Acme"), None, false, None), 0.0);
    }

    #[test]
    fn markup_is_stripped_but_addresses_kept() {
        let region = "From: <b>Acme</b> <jobs@acme.com>\nSubject: Hi there";
        assert_eq!(
            capture_header(region, &FROM_PATTERNS).as_deref(),
            Some("Acme <jobs@acme.com>")
        );
    }

    #[test]
    fn blank_runs_collapse() {
        let body = clean_body("Subject: x\nline one\n\n\n\n\nline two").unwrap();
        assert_eq!(body, "line one\n\nline two");
    }
}
