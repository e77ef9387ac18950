//! Mail ingestion helpers for .eml parsing and HTML rendering.

pub mod eml;
pub mod html;

pub use eml::{MailDirSource, parse_eml};
pub use html::html_to_text;
