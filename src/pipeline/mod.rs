//! Email processing pipeline.
//!
//! Every inbound email flows through:
//! 1. `Unwrapper::unwrap()` recovers the original sender, subject and body of forwards
//! 2. `Extractor::extract()` pulls company, title, status and links (LLM fallback on low confidence)
//! 3. `fingerprint()` detects the same content arriving twice
//! 4. `ApplicationMatcher::match_fact()` picks an application, a new one, or the review queue
//! 5. `Database::commit_email_outcome()` applies the result in one transaction

pub mod dates;
pub mod extractor;
pub mod fingerprint;
pub mod matcher;
pub mod processor;
pub mod sync;
pub mod types;
pub mod unwrapper;

pub use extractor::{ExtractedFact, Extractor, FallbackExtractor, LlmFallbackExtractor};
pub use fingerprint::fingerprint;
pub use matcher::{ApplicationMatcher, CandidateMatch, MatchResult};
pub use processor::EmailPipeline;
pub use sync::{SyncGuard, SyncRegistry, SyncReport, SyncRunner, spawn_retry_loop};
pub use types::{BatchStats, InboundEmail, MailSource, ProcessingResult};
pub use unwrapper::{UnwrapResult, Unwrapper};
