//! Job applications: the stored model and manual review of unattributed emails.

pub mod model;
pub mod review;

pub use review::{ReviewDecision, ReviewService};
