// Storage and file adapters for the reconciliation engine

pub mod csv;
pub mod report;
pub mod sqlite;

pub use crate::csv::DropFolderSource;
pub use crate::report::JsonReportRenderer;
pub use crate::sqlite::{default_db_path, SqliteStore};
