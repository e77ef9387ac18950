//! Job title extraction: subject patterns, then body patterns.

use std::sync::LazyLock;

use regex::Regex;

use super::{compile_all, first_capture};

/// Closed vocabulary that tells a title apart from a company or filler phrase.
const JOB_KEYWORDS: &str = r"(?:Engineer|Developer|Manager|Analyst|Designer|Scientist|Architect|Lead|Senior|Junior|Intern|Associate|Director|Coordinator|Specialist|Administrator|Consultant|Executive|Representative|Assistant|Officer|Technician|Support|Sales|Marketing|Product|Software|Data|Frontend|Backend|Full[\s-]?Stack|DevOps|Cloud|ML|AI|QA|Test|Mobile|Web|UI|UX|HR|Finance|Account|Operations|Business|Project|Program|Technical|Research|Security|Network)";

const SUBJECT_CONFIDENCE: f64 = 0.85;
const BODY_CONFIDENCE: f64 = 0.75;

const SUBJECT_DENYLIST: &[&str] = &[
    "application sent",
    "application received",
    "online assessment",
    "next phase",
    "update",
    "confirmation",
    "complete assessment",
    "thank you",
    "your application",
];

/// Body captures that are places or filler rather than titles.
const BODY_DENYLIST: &[&str] = &["los angeles", "new york", "san francisco", "the company"];

const BAD_TITLES: &[&str] = &["default directory", "email", "the", "and", "your", "unknown"];

static SUBJECT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let kw = JOB_KEYWORDS;
    let patterns = [
        format!(r"(?i)[Yy]our\s+([A-Za-z0-9\s\(\)/,\-&]+?{kw}[A-Za-z0-9\s\(\)/,\-&]*?)\s+(?:Remote\s+)?[Aa]pplication"),
        r"(?i)[Yy]our\s+([A-Za-z0-9\s\-]+?)\s+[Aa]pplication".to_string(),
        format!(r"(?i)-\s+([A-Za-z0-9\s\(\)/,]+?{kw}[A-Za-z0-9\s\(\)/,]*?)$"),
        r"(?i)-\s+([A-Za-z0-9\s\(\)]+?)$".to_string(),
        r"(?i)(?:position|role):\s+(.+?)(?:\s+at|\s+-|$)".to_string(),
        r"(?i)for the\s+(.+?)\s+(?:position|role)".to_string(),
        format!(r"(?i)for\s+([A-Za-z0-9\s\(\)/,\-&]+?{kw}[A-Za-z0-9\s\(\)/,\-&]*?)\s+(?:position|role|at)"),
        r"(?i)-\s+(.+?)\s+(?:position|role)".to_string(),
        r"(?i)application\s+-\s+(.+?)$".to_string(),
        r"(?i)received\s+-\s+(.+?)$".to_string(),
        format!(r"(?i)applying for\s+([A-Za-z0-9\s\(\)/,\-&]+?{kw}[A-Za-z0-9\s\(\)/,\-&]*)"),
        format!(r"(?i)application for\s+([A-Za-z0-9\s\(\)/,\-&]+?{kw}[A-Za-z0-9\s\(\)/,\-&]*)"),
        format!(r"(?i)^([A-Za-z0-9\s\-]+?{kw}[A-Za-z0-9\s\-]*?)\s+at\s+"),
    ];
    compile_all(&patterns.iter().map(String::as_str).collect::<Vec<_>>())
});

static BODY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let kw = JOB_KEYWORDS;
    let c = r"A-Za-z0-9\s\(\),\-&/";
    let patterns = [
        format!(r"(?i)(?:role|position):\s*([{c}]+?)[\.\n]"),
        format!(r"(?i)applying for (?:the\s+)?([{c}]+?{kw}[{c}]*)"),
        format!(r"(?i)application for (?:the\s+)?([{c}]+?{kw}[{c}]*?)(?:\s+position|\s+role|[\.,\n]|$)"),
        format!(r"(?i)for the\s+([{c}]+?{kw}[{c}]*?)\s+position"),
        format!(r"(?i)interest in (?:the\s+)?([{c}]+?)\s+(?:position|role|opportunity)"),
        format!(r"(?i)for (?:the\s+)?([{c}]+?)\s+(?:position|role)"),
        format!(r"(?i)([{c}]+?{kw}[{c}]*?)\s+(?:position|role)\s+at"),
        format!(r"(?i)as an?\s+([{c}]+?{kw}[{c}]*)"),
        format!(r"(?i)(?:for|the|our|this)\s+([A-Za-z0-9\s\-]+?{kw}[A-Za-z0-9\s\-]*?)(?:\s+position|\s+role|\s+opportunity|[\.,\n])"),
        r"(?i)\n\s*([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*?\s+(?:Analyst|Engineer|Manager|Developer|Specialist|Coordinator|Assistant|Intern))\s*\n".to_string(),
    ];
    compile_all(&patterns.iter().map(String::as_str).collect::<Vec<_>>())
});

static CLEANUPS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?i)\s+(?:position|role)$",
        r"(?i)\s+and\s+.*$",
        r"\s+-\s*$",
        r"(?i)\s+-\s+Remote.*$",
    ])
});

/// Extract `(title, confidence)` or `None`.
///
/// Once a pattern yields a candidate, later tiers are not consulted even if cleanup rejects it.
pub(super) fn extract_job_title(subject: &str, body: &str) -> Option<(String, f64)> {
    let subject_hit = SUBJECT_PATTERNS
        .iter()
        .filter_map(|p| first_capture(p, subject))
        .find(|candidate| {
            candidate.chars().count() > 2
                && !SUBJECT_DENYLIST.contains(&candidate.to_lowercase().as_str())
        })
        .map(|t| (t, SUBJECT_CONFIDENCE));

    let (raw, confidence) = subject_hit.or_else(|| {
        BODY_PATTERNS
            .iter()
            .filter_map(|p| first_capture(p, body))
            .find(|candidate| plausible_body_title(candidate))
            .map(|t| (t, BODY_CONFIDENCE))
    })?;

    let title = clean_title(raw);
    let len = title.chars().count();
    if BAD_TITLES.contains(&title.to_lowercase().as_str()) || !(3..=80).contains(&len) {
        return None;
    }
    Some((title, confidence))
}

fn plausible_body_title(candidate: &str) -> bool {
    let len = candidate.chars().count();
    len > 3
        && len < 80
        && !candidate.contains("Recruiting")
        && !candidate.contains("Recruitment")
        && !candidate.contains("Team")
        && !BODY_DENYLIST.contains(&candidate.to_lowercase().as_str())
}

/// Trim role/position suffixes, "and ..." run-ons and "- Remote" fragments.
fn clean_title(raw: &str) -> String {
    let mut title = raw.to_string();
    for pattern in CLEANUPS.iter() {
        title = pattern.replace(&title, "").into_owned();
    }
    title
        .trim_matches(|c: char| matches!(c, '.' | ',' | '-' | ' '))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn your_title_application_subject() {
        let (title, confidence) = extract_job_title(
            "Your Senior Software Engineer Application is now under review",
            "",
        )
        .unwrap();
        assert_eq!(title, "Senior Software Engineer");
        assert_eq!(confidence, 0.85);
    }

    #[test]
    fn trailing_dash_subject() {
        let (title, _) = extract_job_title("Application Received - Data Analyst", "").unwrap();
        assert_eq!(title, "Data Analyst");
    }

    #[test]
    fn body_fallback_strips_position_suffix() {
        let (title, confidence) = extract_job_title(
            "Thanks!",
            "Thank you for applying for the Product Designer position. We will be in touch.",
        )
        .unwrap();
        assert_eq!(title, "Product Designer");
        assert_eq!(confidence, 0.75);
    }

    #[test]
    fn job_board_body_line() {
        let body = "Your application was sent to Eleven Recruiting\n\n\
                    Workday Reporting Analyst\n\
                    Eleven Recruiting - Los Angeles, CA\n";
        let (title, _) =
            extract_job_title("Your application was sent to Eleven Recruiting", body).unwrap();
        assert_eq!(title, "Workday Reporting Analyst");
    }

    #[test]
    fn cleanup_rules() {
        assert_eq!(clean_title("Backend Engineer - Remote (US)"), "Backend Engineer");
        assert_eq!(clean_title("Data Analyst and giving us the"), "Data Analyst");
        assert_eq!(clean_title("Product Manager role"), "Product Manager");
        assert_eq!(clean_title("QA Lead -"), "QA Lead");
    }

    #[test]
    fn too_short_or_filler_is_rejected() {
        assert!(extract_job_title("Position: X", "").is_none());
        assert!(extract_job_title("Thank you for your application", "").is_none());
    }
}
