//! Persistence: libSQL storage for runs, records, surveys, rules and conversations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{BlacklistEntry, Database, SurveyUpdate};
