//! Helpers for generating unique test data
//!
//! ULIDs keep scratch databases and lock keys from colliding between tests
//! running in parallel.

use std::path::Path;

use ulid::Ulid;

/// Generate a unique string in the format `{prefix}-{ulid}`
///
/// # Examples
/// ```
/// use test_support::unique_str;
///
/// let id1 = unique_str("db");
/// let id2 = unique_str("db");
/// assert_ne!(id1, id2);
/// assert!(id1.starts_with("db-"));
/// ```
pub fn unique_str(prefix: &str) -> String {
    format!("{}-{}", prefix, Ulid::new())
}

/// Connection string for a fresh, file-backed SQLite database inside `dir`.
/// The file is created on first connect.
pub fn sqlite_file_url(dir: &Path, prefix: &str) -> String {
    let file = dir.join(format!("{}.db", unique_str(prefix)));
    format!("sqlite://{}?mode=rwc", file.display())
}
