//! URL extraction and classification.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::ExtractedLink;
use super::company::ATS_DOMAINS;
use crate::applications::model::LinkType;

/// Characters of surrounding text kept on each side of a URL.
const LINK_CONTEXT_CHARS: usize = 50;

const ASSESSMENT_DOMAINS: &[&str] = &[
    "hackerrank.com",
    "codesignal.com",
    "codility.com",
    "leetcode.com",
    "testgorilla.com",
];

const SCHEDULING_DOMAINS: &[&str] = &[
    "calendly.com",
    "calendar.google.com",
    "outlook.office.com",
    "when2meet.com",
];

const VIDEO_DOMAINS: &[&str] = &[
    "zoom.us",
    "teams.microsoft.com",
    "meet.google.com",
    "webex.com",
];

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s<>"')]+[^\s<>"'),.]"#).expect("valid regex")
});

/// Every distinct URL in the body, in order of first appearance.
pub(super) fn extract_links(body: &str) -> Vec<ExtractedLink> {
    let mut seen = HashSet::new();
    URL.find_iter(body)
        .filter(|m| seen.insert(m.as_str()))
        .map(|m| {
            let (link_type, confidence) = classify_link(m.as_str());
            ExtractedLink {
                url: m.as_str().to_string(),
                link_type,
                link_text: Some(context_window(body, m.start(), m.end()).to_string()),
                confidence,
            }
        })
        .collect()
}

/// Classify by destination domain.
pub(super) fn classify_link(url: &str) -> (LinkType, f64) {
    let lower = url.to_lowercase();
    let has_any = |domains: &[&str]| domains.iter().any(|d| lower.contains(d));

    if has_any(ASSESSMENT_DOMAINS) {
        (LinkType::AssessmentPortal, 0.9)
    } else if has_any(SCHEDULING_DOMAINS) {
        (LinkType::SchedulingLink, 0.9)
    } else if has_any(VIDEO_DOMAINS) {
        (LinkType::VideoInterview, 0.9)
    } else if has_any(ATS_DOMAINS) {
        (LinkType::CompanyPortal, 0.8)
    } else if has_any(&["jobs", "careers", "apply"]) {
        (LinkType::JobPosting, 0.6)
    } else {
        (LinkType::Other, 0.3)
    }
}

/// Up to `LINK_CONTEXT_CHARS` characters either side of `start..end`.
fn context_window(text: &str, start: usize, end: usize) -> &str {
    let from = text[..start]
        .char_indices()
        .rev()
        .take(LINK_CONTEXT_CHARS)
        .last()
        .map_or(start, |(i, _)| i);
    let to = text[end..]
        .char_indices()
        .nth(LINK_CONTEXT_CHARS)
        .map_or(text.len(), |(i, _)| end + i);
    &text[from..to]
}
