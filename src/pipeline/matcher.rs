//! Matching an extracted fact to an existing application.
//!
//! Strategies run in strict priority order and the first to produce a result wins:
//! 1. Exact (company, title)
//! 2. Fuzzy weighted similarity among recently created applications
//! 3. Company + recent activity ("domain/time")
//! 4. Title-only similarity among recently active applications
//! 5. No match: create when the extraction is confident, else review

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::applications::model::{Application, identity_key};
use crate::config::MatcherConfig;
use crate::pipeline::extractor::ExtractedFact;

/// Which strategy produced a match decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    DomainTime,
    DomainTimeAmbiguous,
    SubjectSimilarity,
    NoMatch,
    NoMatchLowConfidence,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::DomainTime => "domain_time",
            Self::DomainTimeAmbiguous => "domain_time_ambiguous",
            Self::SubjectSimilarity => "subject_similarity",
            Self::NoMatch => "no_match",
            Self::NoMatchLowConfidence => "no_match_low_confidence",
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matcher decision.
///
/// `is_new` and `should_review` are never both true. Neither set means
/// "update `application_id`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub application_id: Option<Uuid>,
    pub match_type: MatchType,
    pub confidence: f64,
    pub is_new: bool,
    pub should_review: bool,
    pub reason: String,
}

/// A ranked application for the review UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub application_id: Uuid,
    pub company_name: String,
    pub job_title: String,
    pub score: f64,
}

pub struct ApplicationMatcher {
    config: MatcherConfig,
}

impl ApplicationMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Match against the user's `applications`.
    pub fn match_fact(
        &self,
        fact: &ExtractedFact,
        email_date: DateTime<Utc>,
        applications: &[Application],
    ) -> MatchResult {
        self.match_fact_at(fact, email_date, applications, Utc::now())
    }

    /// As [`match_fact`](Self::match_fact) with an explicit clock for the creation window.
    pub fn match_fact_at(
        &self,
        fact: &ExtractedFact,
        email_date: DateTime<Utc>,
        applications: &[Application],
        now: DateTime<Utc>,
    ) -> MatchResult {
        let company = fact.company_name.as_deref().filter(|c| !c.trim().is_empty());
        let title = fact.job_title.as_deref().filter(|t| !t.trim().is_empty());

        if let (Some(company), Some(title)) = (company, title) {
            if let Some(result) = self.match_exact(company, title, applications) {
                return result;
            }
            if let Some(result) = self.match_fuzzy(company, title, applications, now) {
                return result;
            }
        }

        if let Some(company) = company
            && let Some(result) = self.match_by_company_and_time(company, email_date, applications)
        {
            return result;
        }

        if let Some(title) = title
            && let Some(result) = self.match_by_title_similarity(title, email_date, applications)
        {
            return result;
        }

        self.no_match(fact.overall_confidence)
    }

    fn match_exact(
        &self,
        company: &str,
        title: &str,
        applications: &[Application],
    ) -> Option<MatchResult> {
        let (company_key, title_key) = (identity_key(company), identity_key(title));
        let app = applications
            .iter()
            .find(|a| a.company_key() == company_key && a.title_key() == title_key)?;
        Some(MatchResult {
            application_id: Some(app.id),
            match_type: MatchType::Exact,
            confidence: 1.0,
            is_new: false,
            should_review: false,
            reason: format!("Exact match: {company} - {title}"),
        })
    }

    fn match_fuzzy(
        &self,
        company: &str,
        title: &str,
        applications: &[Application],
        now: DateTime<Utc>,
    ) -> Option<MatchResult> {
        let created_after = now - Duration::days(self.config.time_window_days);
        let (company, title) = (company.to_lowercase(), title.to_lowercase());

        let mut best: Option<(&Application, f64)> = None;
        for app in applications.iter().filter(|a| a.created_at >= created_after) {
            let score = self.weighted_similarity(Some(&company), Some(&title), app);
            let best_so_far = best.map_or(0.0, |(_, s)| s);
            if score > best_so_far && score >= self.config.fuzzy_threshold {
                best = Some((app, score));
            }
        }

        let (app, score) = best?;
        Some(MatchResult {
            application_id: Some(app.id),
            match_type: MatchType::Fuzzy,
            confidence: score,
            is_new: false,
            should_review: score < self.config.fuzzy_auto_accept,
            reason: format!(
                "Fuzzy match ({score:.2}): {} - {}",
                app.company_name, app.job_title
            ),
        })
    }

    /// Company substring match among applications active in the window.
    ///
    /// A single candidate is assigned but still queued for confirmation.
    fn match_by_company_and_time(
        &self,
        company: &str,
        email_date: DateTime<Utc>,
        applications: &[Application],
    ) -> Option<MatchResult> {
        let needle = company.trim().to_lowercase();
        let active_after = email_date - Duration::days(self.config.time_window_days);
        let candidates: Vec<&Application> = applications
            .iter()
            .filter(|a| {
                a.company_name.to_lowercase().contains(&needle)
                    && a.latest_email_date >= active_after
            })
            .collect();

        match candidates.as_slice() {
            [] => None,
            [app] => Some(MatchResult {
                application_id: Some(app.id),
                match_type: MatchType::DomainTime,
                confidence: self.config.domain_single_confidence,
                is_new: false,
                should_review: true,
                reason: format!("Single application found for {company} in time window"),
            }),
            _ => Some(MatchResult {
                application_id: None,
                match_type: MatchType::DomainTimeAmbiguous,
                confidence: self.config.domain_ambiguous_confidence,
                is_new: false,
                should_review: true,
                reason: format!(
                    "Multiple applications found for {company} - manual review needed"
                ),
            }),
        }
    }

    fn match_by_title_similarity(
        &self,
        title: &str,
        email_date: DateTime<Utc>,
        applications: &[Application],
    ) -> Option<MatchResult> {
        let active_after = email_date - Duration::days(self.config.subject_window_days);
        let title = title.to_lowercase();

        let mut best: Option<(&Application, f64)> = None;
        for app in applications
            .iter()
            .filter(|a| a.latest_email_date >= active_after)
        {
            let similarity = sequence_ratio(&title, &app.job_title.to_lowercase());
            let best_so_far = best.map_or(0.0, |(_, s)| s);
            if similarity > best_so_far && similarity >= self.config.subject_threshold {
                best = Some((app, similarity));
            }
        }

        let (app, similarity) = best?;
        Some(MatchResult {
            application_id: Some(app.id),
            match_type: MatchType::SubjectSimilarity,
            confidence: similarity * self.config.subject_discount,
            is_new: false,
            should_review: true,
            reason: format!("Job title similarity ({similarity:.2}): {}", app.job_title),
        })
    }

    fn no_match(&self, extraction_confidence: f64) -> MatchResult {
        if extraction_confidence >= self.config.new_application_floor {
            MatchResult {
                application_id: None,
                match_type: MatchType::NoMatch,
                confidence: extraction_confidence,
                is_new: true,
                should_review: false,
                reason: "No existing match found - creating new application".to_string(),
            }
        } else {
            MatchResult {
                application_id: None,
                match_type: MatchType::NoMatchLowConfidence,
                confidence: extraction_confidence,
                is_new: false,
                should_review: true,
                reason: format!(
                    "Low extraction confidence ({extraction_confidence:.2}) - manual review required"
                ),
            }
        }
    }

    /// Top `limit` recent applications by weighted similarity. Read-only.
    pub fn find_candidates(
        &self,
        company: Option<&str>,
        title: Option<&str>,
        limit: usize,
        applications: &[Application],
    ) -> Vec<CandidateMatch> {
        self.find_candidates_at(company, title, limit, applications, Utc::now())
    }

    pub fn find_candidates_at(
        &self,
        company: Option<&str>,
        title: Option<&str>,
        limit: usize,
        applications: &[Application],
        now: DateTime<Utc>,
    ) -> Vec<CandidateMatch> {
        let company = company.filter(|c| !c.is_empty()).map(str::to_lowercase);
        let title = title.filter(|t| !t.is_empty()).map(str::to_lowercase);
        if company.is_none() && title.is_none() {
            return Vec::new();
        }

        let created_after = now - Duration::days(self.config.time_window_days);
        let mut candidates: Vec<CandidateMatch> = applications
            .iter()
            .filter(|a| a.created_at >= created_after)
            .filter_map(|app| {
                let score = self.weighted_similarity(company.as_deref(), title.as_deref(), app);
                (score > self.config.candidate_floor).then(|| CandidateMatch {
                    application_id: app.id,
                    company_name: app.company_name.clone(),
                    job_title: app.job_title.clone(),
                    score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(limit);
        candidates
    }

    /// `company_weight * sim(company) + title_weight * sim(title)`; absent parts contribute 0.
    /// Inputs are expected lowercased.
    fn weighted_similarity(&self, company: Option<&str>, title: Option<&str>, app: &Application) -> f64 {
        let company_sim =
            company.map_or(0.0, |c| sequence_ratio(c, &app.company_name.to_lowercase()));
        let title_sim = title.map_or(0.0, |t| sequence_ratio(t, &app.job_title.to_lowercase()));
        company_sim * self.config.company_weight + title_sim * self.config.title_weight
    }
}

// ── String similarity ───────────────────────────────────────────────

/// Ratcliff/Obershelp similarity `2*M / T` over characters, in [0, 1].
///
/// `M` is the total size of the matching blocks found by recursively taking the
/// longest common substring (earliest on ties) and recursing on both sides.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Longest common run in `a[alo..ahi]` and `b[blo..bhi]` as `(i, j, len)`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let width = bhi - blo;
    let mut best = (alo, blo, 0);
    // run[j + 1] = length of the common run ending at (i, blo + j)
    let mut prev = vec![0usize; width + 1];
    let mut cur = vec![0usize; width + 1];
    for i in alo..ahi {
        for j in 0..width {
            cur[j + 1] = if a[i] == b[blo + j] { prev[j] + 1 } else { 0 };
            let k = cur[j + 1];
            if k > best.2 {
                best = (i + 1 - k, blo + j + 1 - k, k);
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applications::model::ApplicationStatus;
    use crate::pipeline::extractor::ExtractionMethod;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn app(company: &str, title: &str, days_ago: i64) -> Application {
        let seen = now() - Duration::days(days_ago);
        let mut app = Application::new("u1", company, title, ApplicationStatus::AppliedReceived, seen);
        app.created_at = seen;
        app
    }

    fn fact(company: Option<&str>, title: Option<&str>, confidence: f64) -> ExtractedFact {
        let mut fact = ExtractedFact::empty(ExtractionMethod::RuleBased);
        fact.company_name = company.map(str::to_string);
        fact.job_title = title.map(str::to_string);
        fact.overall_confidence = confidence;
        fact
    }

    fn matcher() -> ApplicationMatcher {
        ApplicationMatcher::new(MatcherConfig::default())
    }

    #[test]
    fn ratio_matches_reference_values() {
        assert_eq!(sequence_ratio("", ""), 1.0);
        assert_eq!(sequence_ratio("abc", ""), 0.0);
        assert_eq!(sequence_ratio("abcd", "abcd"), 1.0);
        // Known values of the Ratcliff/Obershelp ratio.
        assert!((sequence_ratio("abcd", "bcde") - 0.75).abs() < 1e-9);
        assert!((sequence_ratio("acme", "acme inc") - 2.0 * 4.0 / 12.0).abs() < 1e-9);
        assert!((sequence_ratio("software engineer", "software engineer ii") - 34.0 / 37.0).abs() < 1e-9);
    }

    #[test]
    fn exact_wins_over_everything() {
        let apps = vec![
            app("Acme Inc", "Data Analyst", 1),
            app("Acme", "Data Analyst", 5),
        ];
        let result = matcher().match_fact_at(
            &fact(Some("  ACME "), Some("data analyst"), 0.9),
            now(),
            &apps,
            now(),
        );
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.application_id, Some(apps[1].id));
        assert_eq!(result.confidence, 1.0);
        assert!(!result.should_review);
        assert!(!result.is_new);
    }

    #[test]
    fn fuzzy_high_score_is_accepted() {
        let apps = vec![app("Acme Corp", "Software Engineer", 10)];
        let result = matcher().match_fact_at(
            &fact(Some("Acme Corp."), Some("Software Engineer II"), 0.9),
            now(),
            &apps,
            now(),
        );
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert_eq!(result.application_id, Some(apps[0].id));
        assert!(result.confidence >= 0.90);
        assert!(!result.should_review);
    }

    #[test]
    fn fuzzy_near_threshold_is_reviewed() {
        // 0.6 * sim("acme", "acme corp") + 0.4 * 1.0 ≈ 0.86
        let apps = vec![app("Acme Corp", "Software Engineer", 10)];
        let result = matcher().match_fact_at(
            &fact(Some("Acme"), Some("Software Engineer"), 0.9),
            now(),
            &apps,
            now(),
        );
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert!(result.confidence >= 0.80 && result.confidence < 0.90);
        assert!(result.should_review);
    }

    #[test]
    fn fuzzy_ignores_old_applications() {
        let apps = vec![app("Acme Corp", "Software Engineer", 90)];
        let result = matcher().match_fact_at(
            &fact(Some("Acme Corp."), Some("Software Engineer II"), 0.9),
            now(),
            &apps,
            now(),
        );
        assert_ne!(result.match_type, MatchType::Fuzzy);
    }

    #[test]
    fn single_company_candidate_is_assigned_and_reviewed() {
        let apps = vec![app("Globex Corporation", "Platform Engineer", 20)];
        let result = matcher().match_fact_at(&fact(Some("Globex"), None, 0.5), now(), &apps, now());
        assert_eq!(result.match_type, MatchType::DomainTime);
        assert_eq!(result.application_id, Some(apps[0].id));
        assert_eq!(result.confidence, 0.75);
        assert!(result.should_review);
        assert!(!result.is_new);
    }

    #[test]
    fn multiple_company_candidates_are_ambiguous() {
        let apps = vec![
            app("Globex", "Platform Engineer", 20),
            app("Globex", "Data Engineer", 3),
        ];
        let result = matcher().match_fact_at(&fact(Some("Globex"), None, 0.5), now(), &apps, now());
        assert_eq!(result.match_type, MatchType::DomainTimeAmbiguous);
        assert!(result.application_id.is_none());
        assert_eq!(result.confidence, 0.5);
        assert!(result.should_review);
    }

    #[test]
    fn title_only_match_is_discounted() {
        let apps = vec![app("Initech", "Senior Data Analyst", 5)];
        let result = matcher().match_fact_at(
            &fact(None, Some("Senior Data Analyst"), 0.75),
            now(),
            &apps,
            now(),
        );
        assert_eq!(result.match_type, MatchType::SubjectSimilarity);
        assert!((result.confidence - 0.7).abs() < 1e-9);
        assert!(result.should_review);
    }

    #[test]
    fn no_match_floor() {
        let result = matcher().match_fact_at(&fact(None, None, 0.59), now(), &[], now());
        assert_eq!(result.match_type, MatchType::NoMatchLowConfidence);
        assert!(!result.is_new);
        assert!(result.should_review);
        assert_eq!(result.confidence, 0.59);

        let result = matcher().match_fact_at(&fact(None, None, 0.60), now(), &[], now());
        assert_eq!(result.match_type, MatchType::NoMatch);
        assert!(result.is_new);
        assert!(!result.should_review);
    }

    #[test]
    fn candidates_are_ranked_and_limited() {
        let apps = vec![
            app("Acme", "Data Analyst", 1),
            app("Acme Corp", "Data Analyst", 2),
            app("Zebra", "Chef", 3),
        ];
        let candidates =
            matcher().find_candidates_at(Some("Acme"), Some("Data Analyst"), 1, &apps, now());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].application_id, apps[0].id);

        let all = matcher().find_candidates_at(Some("Acme"), Some("Data Analyst"), 10, &apps, now());
        assert_eq!(all.len(), 2);
        assert!(all[0].score >= all[1].score);

        assert!(matcher().find_candidates_at(None, None, 5, &apps, now()).is_empty());
    }
}
