//! Company name extraction: an ordered strategy list, first hit wins.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use super::{compile_all, first_capture};

/// ATS vendors. Mail from these never names the employer in its domain.
pub(super) const ATS_DOMAINS: &[&str] = &[
    "workday.com",
    "myworkdaysite.com",
    "greenhouse.io",
    "lever.co",
    "icims.com",
    "smartrecruiters.com",
    "ashbyhq.com",
    "breezy.hr",
    "jobvite.com",
];

const PERSONAL_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "aol.com",
    "protonmail.com",
    "mail.com",
    "zoho.com",
];

const JOB_BOARD_DOMAINS: &[&str] = &[
    "linkedin.com",
    "indeed.com",
    "glassdoor.com",
    "ziprecruiter.com",
];

/// Subject captures that are phrases, not companies.
const SUBJECT_DENYLIST: &[&str] = &[
    "application received",
    "thank you",
    "your application",
    "next phase",
    "update from",
    "your update from",
    "online assessment",
    "default directory",
    "email",
    "your",
];

static JOB_BOARD_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)application was sent to\s+([A-Z][A-Za-z0-9\s&.]+)").expect("valid regex")
});

static ATS_BODY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"interest in employment.*?with\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+and",
        r"interest in\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+and",
        r"Sincerely,\s*\n\s*([A-Z][A-Za-z0-9\s&.]+?)\s+(?:Recruitment|Recruiting|Team)",
        r"Thank you.*?interest in\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\.",
    ])
});

static SUBJECT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"application was sent to\s+([A-Z][A-Za-z0-9\s&.]+?)$",
        r"application to\s+([A-Z][A-Za-z0-9\s&.]+?)$",
        r"^([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+-\s+",
        r"(?i:thank you for applying to)\s+([A-Z][A-Za-z0-9\s&.]+)",
    ])
});

static BODY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"application to\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)[.\n]",
        r"interest in employment.*?with\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+and",
        r"interest in\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+and",
        r"interest in\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)!",
        r"thank you for.*?applying to\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+for",
        r"position at\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+in",
        r"position at\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)[.\n,]",
        r"([A-Z][A-Za-z0-9\s&.]{2,40}?)\s+has invited you",
        r"team at\s+([A-Z][A-Za-z0-9\s&.]{2,40}?)[\n.]",
        r"Sincerely,\s*\n\s*(?:The\s+)?([A-Z][A-Za-z0-9\s&.]+?)\s+(?:Recruitment|Recruiting|Team)",
        r"Thanks.*?again,\s*\n\s*([A-Z][A-Za-z0-9\s&.]+?)(?:\s|$)",
    ])
});

static TRAILING_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(?:Team|Recruitment|Recruiting|Services|Careers|Online Assessment)$")
        .expect("valid regex")
});

struct Inputs<'a> {
    subject: &'a str,
    body: &'a str,
    from: String,
    domain: Option<String>,
}

struct Strategy {
    name: &'static str,
    confidence: f64,
    /// Generic strategies get trailing-noise cleanup; sender-specific ones are kept verbatim.
    cleanup: bool,
    run: fn(&Inputs<'_>) -> Option<String>,
}

static STRATEGIES: &[Strategy] = &[
    Strategy {
        name: "job_board_subject",
        confidence: 0.9,
        cleanup: false,
        run: job_board_subject,
    },
    Strategy {
        name: "ats_body",
        confidence: 0.9,
        cleanup: false,
        run: ats_body,
    },
    Strategy {
        name: "subject",
        confidence: 0.85,
        cleanup: true,
        run: generic_subject,
    },
    Strategy {
        name: "body",
        confidence: 0.85,
        cleanup: true,
        run: generic_body,
    },
    Strategy {
        name: "sender_domain",
        confidence: 0.5,
        cleanup: true,
        run: company_from_domain,
    },
];

/// Extract `(company, confidence)` or `None`.
pub(super) fn extract_company(subject: &str, body: &str, from: &str) -> Option<(String, f64)> {
    let inputs = Inputs {
        subject,
        body,
        from: from.to_lowercase(),
        domain: sender_domain(from),
    };

    STRATEGIES.iter().find_map(|strategy| {
        let raw = (strategy.run)(&inputs)?;
        let company = if strategy.cleanup {
            clean_company_name(&raw)
        } else {
            raw
        };
        if company.is_empty() {
            return None;
        }
        trace!(strategy = strategy.name, company = %company, "Company extracted");
        Some((company, strategy.confidence))
    })
}

/// Strip trailing noise words until none remain ("Acme Recruiting Team" → "Acme").
pub fn clean_company_name(name: &str) -> String {
    let mut current = name.trim().to_string();
    loop {
        let stripped = TRAILING_NOISE.replace(&current, "").trim().to_string();
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

fn job_board_subject(inputs: &Inputs<'_>) -> Option<String> {
    if !inputs.from.contains("linkedin.com") {
        return None;
    }
    first_capture(&JOB_BOARD_SUBJECT, inputs.subject)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn ats_body(inputs: &Inputs<'_>) -> Option<String> {
    let domain = inputs.domain.as_deref()?;
    let from_ats = domain.contains("myworkday") || ATS_DOMAINS.iter().any(|d| domain.contains(d));
    if !from_ats {
        return None;
    }
    ATS_BODY_PATTERNS
        .iter()
        .find_map(|p| first_capture(p, inputs.body))
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn generic_subject(inputs: &Inputs<'_>) -> Option<String> {
    SUBJECT_PATTERNS
        .iter()
        .filter_map(|p| first_capture(p, inputs.subject))
        .find(|candidate| {
            let lower = candidate.to_lowercase();
            candidate.chars().count() > 2
                && !SUBJECT_DENYLIST.contains(&lower.as_str())
                && !lower.starts_with("your ")
                && !lower.starts_with("account")
        })
        .map(str::to_string)
}

fn generic_body(inputs: &Inputs<'_>) -> Option<String> {
    BODY_PATTERNS
        .iter()
        .filter_map(|p| first_capture(p, inputs.body))
        .find(|candidate| candidate.chars().count() > 2)
        .map(str::to_string)
}

/// Last resort: title-case the registrable label of the sender's domain.
fn company_from_domain(inputs: &Inputs<'_>) -> Option<String> {
    let domain = inputs.domain.as_deref()?;
    if PERSONAL_DOMAINS.contains(&domain)
        || JOB_BOARD_DOMAINS.iter().any(|d| domain.ends_with(d))
        || ATS_DOMAINS.iter().any(|d| domain.contains(d))
    {
        return None;
    }

    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    let label = match labels.len() {
        0 => return None,
        1 => labels[0],
        n if n >= 3 && matches!(labels[n - 2], "co" | "com" | "org" | "net" | "ac" | "gov") => {
            labels[n - 3]
        }
        n => labels[n - 2],
    };

    let name = title_case(&label.replace(['-', '_'], " "));
    (name.chars().count() > 2).then_some(name)
}

/// Lowercased domain of the sender, from `Name <user@host>` or a bare address.
fn sender_domain(from: &str) -> Option<String> {
    let at = from.rfind('@')?;
    let domain = from[at + 1..]
        .trim()
        .trim_end_matches('>')
        .trim()
        .to_lowercase();
    (!domain.is_empty()).then_some(domain)
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_board_subject_is_verbatim() {
        let (company, confidence) = extract_company(
            "Your application was sent to Acme Careers",
            "",
            "LinkedIn <jobs-noreply@linkedin.com>",
        )
        .unwrap();
        assert_eq!(company, "Acme Careers");
        assert_eq!(confidence, 0.9);
    }

    #[test]
    fn ats_body_phrase() {
        let body = "Thank you for your interest in employment opportunities with \
                    Globex Corporation and for applying.";
        let (company, confidence) =
            extract_company("Application update", body, "globex@myworkday.com").unwrap();
        assert_eq!(company, "Globex Corporation");
        assert_eq!(confidence, 0.9);
    }

    #[test]
    fn subject_candidate_is_cleaned() {
        let (company, confidence) = extract_company(
            "Acme Recruiting Team - Software Engineer",
            "",
            "no-reply@greenhouse.io",
        )
        .unwrap();
        assert_eq!(company, "Acme");
        assert_eq!(confidence, 0.85);
    }

    #[test]
    fn cleanup_repeats_until_stable() {
        assert_eq!(clean_company_name("Acme Recruiting Team"), "Acme");
        assert_eq!(clean_company_name("Initech Careers"), "Initech");
        assert_eq!(clean_company_name("Hooli Online Assessment"), "Hooli");
        assert_eq!(clean_company_name("Teamwork Inc"), "Teamwork Inc");
    }

    #[test]
    fn denied_subject_falls_through_to_body() {
        let body = "We appreciate your interest in Initech and the time you spent.";
        let (company, confidence) =
            extract_company("Thank you - next steps", body, "hr@initech.com").unwrap();
        assert_eq!(company, "Initech");
        assert_eq!(confidence, 0.85);
    }

    #[test]
    fn your_prefix_is_not_a_company() {
        let (company, confidence) = extract_company(
            "Your Data Analyst application - next steps",
            "",
            "Jobs <jobs@acme-corp.com>",
        )
        .unwrap();
        assert_eq!(company, "Acme Corp");
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn domain_fallback_skips_personal_and_job_boards() {
        assert!(extract_company("hello", "", "friend@gmail.com").is_none());
        assert!(extract_company("hello", "", "alerts@indeed.com").is_none());
        assert!(extract_company("hello", "", "noreply@greenhouse.io").is_none());
    }

    #[test]
    fn domain_fallback_uses_registrable_label() {
        let (company, _) = extract_company("hello", "", "talent@careers.umbrella.co.uk").unwrap();
        assert_eq!(company, "Umbrella");
    }
}
