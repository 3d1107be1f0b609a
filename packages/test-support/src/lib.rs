//! Test support utilities
//!
//! Unified logging initialization, unique names for scratch databases and a
//! scripted migration whose behavior tests can steer.

pub mod logging;
pub mod scripted;
pub mod unique_helpers;

pub use scripted::ScriptedMigration;
pub use unique_helpers::{sqlite_file_url, unique_str};
