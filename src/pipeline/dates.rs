//! Lenient parsing of the date strings found in forwarded headers and email bodies.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Date-time layouts seen in forwarded-header blocks, tried in order.
/// Offsets are stripped beforehand and times are taken as UTC.
const DATETIME_FORMATS: &[&str] = &[
    "%a, %b %d, %Y at %I:%M %p", // Gmail: Mon, Jan 15, 2024 at 10:30 AM
    "%a, %b %d, %Y %I:%M %p",
    "%A, %B %d, %Y %I:%M %p", // Outlook: Wednesday, January 17, 2024 3:45 PM
    "%A, %B %d, %Y at %I:%M %p",
    "%a, %d %b %Y %H:%M:%S",
    "%a, %d %b %Y %H:%M",
    "%d %b %Y %H:%M:%S",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Date-only layouts, resolved to midnight UTC.
const DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%m/%d/%Y", "%Y-%m-%d", "%d %B %Y"];

/// Parse a header or body date. Returns `None` for anything unrecognized.
pub fn parse_email_date(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim().trim_end_matches(['.', ',']);
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let cleaned = strip_zone_suffix(trimmed);
    // chrono wants "AM"/"PM" with a space, and some clients write "10:30AM"
    let cleaned = normalize_meridiem(cleaned);

    for fmt in DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Some(ndt.and_utc());
        }
    }
    parse_calendar_date(&cleaned)
}

/// Parse a bare calendar date ("January 15, 2024", "01/15/2024") as midnight UTC.
pub fn parse_calendar_date(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim().trim_end_matches(['.', ',']);
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(trimmed, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|ndt| ndt.and_utc())
    })
}

/// Drop a trailing numeric offset or zone name ("+0000", "GMT", "(UTC)", "PST").
fn strip_zone_suffix(s: &str) -> &str {
    let mut out = s.trim_end();
    if let Some(idx) = out.rfind(" (") {
        out = out[..idx].trim_end();
    }
    if let Some((head, tail)) = out.rsplit_once(' ') {
        let is_offset = (tail.starts_with('+') || tail.starts_with('-'))
            && tail.len() == 5
            && tail[1..].chars().all(|c| c.is_ascii_digit());
        let is_zone_name = (2..=4).contains(&tail.len())
            && tail.chars().all(|c| c.is_ascii_uppercase())
            && tail != "AM"
            && tail != "PM";
        if is_offset || is_zone_name {
            return head.trim_end();
        }
    }
    out
}

fn normalize_meridiem(s: &str) -> String {
    let upper_end = s.to_ascii_uppercase();
    for suffix in ["AM", "PM"] {
        if upper_end.ends_with(suffix) && !upper_end.ends_with(&format!(" {suffix}")) {
            let cut = s.len() - 2;
            if s[..cut].ends_with(|c: char| c.is_ascii_digit()) {
                return format!("{} {}", &s[..cut], suffix);
            }
        }
    }
    s.to_string()
}
