//! Persistence layer: libSQL-backed storage for emails, applications and reviews.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ActionUpdate, ApplicationUpdate, ApplicationWrite, Database, EmailCommit, EmailDerivation,
    OutcomePlan, ReviewClosure,
};
