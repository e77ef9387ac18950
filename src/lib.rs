//! Job Tracker turns job-application emails into a per-user application timeline.

pub mod applications;
pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod store;
