//! Location, required action and action deadline.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use super::{compile_all, first_capture};
use crate::applications::model::ActionType;
use crate::pipeline::dates::parse_calendar_date;

static LOCATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?i)location:\s*(.+?)[\n.]",
        r"(?i)based in\s+(.+?)[\n.]",
        r"(?i)\((.+?(?:Remote|Hybrid|On-site))\)",
    ])
});

static REMOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bremote\b").expect("valid regex"));

/// Best effort; no confidence attached.
pub(super) fn extract_location(body: &str) -> Option<String> {
    for pattern in LOCATION_PATTERNS.iter() {
        if let Some(location) = first_capture(pattern, body)
            && location.chars().count() < 100
        {
            return Some(location.to_string());
        }
    }
    REMOTE.is_match(body).then(|| "Remote".to_string())
}

// ── Actions ─────────────────────────────────────────────────────────

/// A follow-up the candidate has to take.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct DetectedAction {
    pub kind: ActionType,
    pub description: &'static str,
    pub deadline: Option<DateTime<Utc>>,
}

/// Ordered; only the first group with a keyword hit fires.
const ACTION_GROUPS: &[(ActionType, &str, &[&str])] = &[
    (
        ActionType::CompleteAssessment,
        "Complete technical assessment",
        &["complete the assessment", "coding challenge", "take-home"],
    ),
    (
        ActionType::ScheduleInterview,
        "Schedule interview time",
        &["schedule", "select a time", "availability", "pick a slot"],
    ),
    (
        ActionType::RespondToEmail,
        "Respond to recruiter",
        &["please respond", "let us know", "reply with"],
    ),
];

const OFFER_DECISION_WORDS: &[&str] = &["accept", "decision", "expire"];

/// Detect a required action in lowercased `subject\nbody` text.
pub(super) fn detect_action(text: &str, email_date: Option<DateTime<Utc>>) -> Option<DetectedAction> {
    let (kind, description) = ACTION_GROUPS
        .iter()
        .find(|(_, _, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(kind, description, _)| (*kind, *description))
        .or_else(|| {
            (text.contains("offer") && OFFER_DECISION_WORDS.iter().any(|w| text.contains(w)))
                .then_some((ActionType::AcceptOffer, "Review and respond to offer"))
        })?;

    Some(DetectedAction {
        kind,
        description,
        deadline: parse_deadline(text, email_date),
    })
}

// ── Deadlines ───────────────────────────────────────────────────────

static DEADLINE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)deadline:?\s*(.+?)[\n.]").expect("valid regex"));

static EXPLICIT_DATES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_all(&[r"(\d{1,2}/\d{1,2}/\d{4})", r"(?i)([a-z]+ \d{1,2}, \d{4})"]));

static RELATIVE_PERIOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:in|within)\s+(\d+|an?|one|two|three|four|five|six|seven)\s+(days?|weeks?)\b")
        .expect("valid regex")
});

/// Explicit date after "deadline", else a relative period resolved against the email date.
fn parse_deadline(text: &str, email_date: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if let Some(segment) = first_capture(&DEADLINE_SEGMENT, text) {
        let explicit = EXPLICIT_DATES
            .iter()
            .filter_map(|p| first_capture(p, segment))
            .find_map(parse_calendar_date);
        if explicit.is_some() {
            return explicit;
        }
        if let Some(relative) = relative_deadline(segment, email_date) {
            return Some(relative);
        }
    }
    relative_deadline(text, email_date)
}

fn relative_deadline(text: &str, email_date: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let base = email_date?;
    let caps = RELATIVE_PERIOD.captures(text)?;
    let count: i64 = match &caps[1].to_lowercase()[..] {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        digits => digits.parse().ok()?,
    };
    let days = if caps[2].to_lowercase().starts_with("week") {
        count.checked_mul(7)?
    } else {
        count
    };
    Duration::try_days(days).and_then(|d| base.checked_add_signed(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn explicit_location_patterns() {
        assert_eq!(
            extract_location("Location: Austin, TX\nMore text").as_deref(),
            Some("Austin, TX")
        );
        assert_eq!(
            extract_location("The team is based in Berlin.").as_deref(),
            Some("Berlin")
        );
        assert_eq!(
            extract_location("Backend Engineer (New York, Hybrid)").as_deref(),
            Some("New York, Hybrid")
        );
    }

    #[test]
    fn bare_remote_keyword() {
        assert_eq!(
            extract_location("This role is fully remote").as_deref(),
            Some("Remote")
        );
        assert!(extract_location("We are in the office every day").is_none());
        assert!(extract_location("remotely possible").is_none());
    }

    #[test]
    fn first_action_group_wins() {
        let action =
            detect_action("please complete the assessment and let us know", None).unwrap();
        assert_eq!(action.kind, ActionType::CompleteAssessment);
        assert_eq!(action.description, "Complete technical assessment");
    }

    #[test]
    fn scheduling_and_response() {
        assert_eq!(
            detect_action("please select a time that works", None).unwrap().kind,
            ActionType::ScheduleInterview
        );
        assert_eq!(
            detect_action("please respond by friday", None).unwrap().kind,
            ActionType::RespondToEmail
        );
    }

    #[test]
    fn offer_needs_decision_word() {
        assert_eq!(
            detect_action("your offer will expire soon", None).unwrap().kind,
            ActionType::AcceptOffer
        );
        assert!(detect_action("we offer great benefits", None).is_none());
    }

    #[test]
    fn explicit_deadline_dates() {
        let action =
            detect_action("coding challenge\ndeadline: 03/15/2024\n", Some(base())).unwrap();
        assert_eq!(
            action.deadline,
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap())
        );

        let action = detect_action(
            "take-home exercise. deadline: march 20, 2024\n",
            Some(base()),
        )
        .unwrap();
        assert_eq!(
            action.deadline,
            Some(Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn relative_deadlines() {
        let action = detect_action("complete the assessment within 3 days", Some(base())).unwrap();
        assert_eq!(action.deadline, Some(base() + Duration::days(3)));

        let action = detect_action("complete the assessment within a week", Some(base())).unwrap();
        assert_eq!(action.deadline, Some(base() + Duration::days(7)));

        // No anchor date, no relative deadline.
        let action = detect_action("complete the assessment within a week", None).unwrap();
        assert!(action.deadline.is_none());
    }
}
