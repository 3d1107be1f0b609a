//! Test logging shared by unit and integration tests.
//!
//! Level precedence: `TEST_LOG`, then `RUST_LOG`, then `warn`. The admin pool
//! logs every statement through sqlx at info; those stay at `warn` unless the
//! directives name `sqlx` explicitly.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

fn directives() -> String {
    let base = std::env::var("TEST_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    if base.contains("sqlx") {
        base
    } else {
        format!("{base},sqlx=warn")
    }
}

/// Install the test subscriber once per process. Safe to call from every test.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_new(directives()).unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init()
            .ok(); // another subscriber may already be installed
    });
}
