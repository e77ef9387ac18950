//! Email intent classification by ordered keyword groups.

use crate::applications::model::EmailType;

/// Groups are tested in order; the first group with any substring hit wins.
const KEYWORD_GROUPS: &[(EmailType, &[&str])] = &[
    (
        EmailType::ApplicationConfirmation,
        &[
            "application received",
            "application was sent",
            "thank you for applying",
            "thank you for your application",
            "we have received your application",
            "application confirmation",
            "successfully submitted",
            "applied on",
        ],
    ),
    (
        EmailType::Rejection,
        &[
            "not moving forward",
            "decided to move forward with other candidates",
            "not selected",
            "unfortunately",
            "regret to inform",
            "pursue other candidates",
            "will not be proceeding",
        ],
    ),
    (
        EmailType::AssessmentInvite,
        &[
            "coding challenge",
            "technical assessment",
            "complete the assessment",
            "hackerrank",
            "codesignal",
            "take-home",
        ],
    ),
    (
        EmailType::InterviewRequest,
        &[
            "schedule an interview",
            "interview invitation",
            "would like to interview",
            "calendar",
            "availability",
            "please let us know",
            "select a time",
        ],
    ),
    (
        EmailType::InterviewConfirmation,
        &[
            "interview is scheduled",
            "confirmed for",
            "interview details",
            "zoom link",
            "meeting link",
        ],
    ),
    (
        EmailType::Offer,
        &[
            "offer",
            "extend an offer",
            "pleased to offer",
            "compensation",
            "offer letter",
        ],
    ),
    (
        EmailType::GeneralUpdate,
        &["update", "status", "wanted to reach out"],
    ),
];

/// Classify by substring match over the lowercased subject and body.
pub(super) fn classify_email_type(subject: &str, body: &str) -> EmailType {
    let text = format!("{subject} {body}").to_lowercase();
    KEYWORD_GROUPS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(email_type, _)| *email_type)
        .unwrap_or(EmailType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_phrases() {
        assert_eq!(
            classify_email_type("Thank you for applying to Acme", ""),
            EmailType::ApplicationConfirmation
        );
        assert_eq!(
            classify_email_type("Hello", "Your application was sent to Acme"),
            EmailType::ApplicationConfirmation
        );
    }

    #[test]
    fn earlier_group_wins() {
        // "unfortunately" and "offer" both appear; rejection is tested first.
        assert_eq!(
            classify_email_type("Your offer", "Unfortunately we cannot extend an offer."),
            EmailType::Rejection
        );
    }

    #[test]
    fn interview_and_offer() {
        assert_eq!(
            classify_email_type("Next steps", "Please share your availability for next week"),
            EmailType::InterviewRequest
        );
        assert_eq!(
            classify_email_type("Your interview", "Here is the zoom link for Tuesday"),
            EmailType::InterviewConfirmation
        );
        assert_eq!(
            classify_email_type("Good news", "We are pleased to offer you the role"),
            EmailType::Offer
        );
    }

    #[test]
    fn general_and_unknown() {
        assert_eq!(
            classify_email_type("Status of your candidacy", ""),
            EmailType::GeneralUpdate
        );
        assert_eq!(classify_email_type("Lunch?", "tacos at noon"), EmailType::Unknown);
    }
}
