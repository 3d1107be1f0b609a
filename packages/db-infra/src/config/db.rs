use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sea_orm::DatabaseBackend;
use serde::Deserialize;

use crate::config::ledger::LedgerConfig;
use crate::error::DbInfraError;
use crate::infra::db::core::sanitize_db_url;

/// Selects which `appsettings.{Env}.json` is loaded.
pub const ENVIRONMENT_VAR: &str = "APP_ENVIRONMENT";

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BODY_TIMEOUT_MS: u64 = 600_000;

/// Database backend, derived from the connection string scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Postgres,
    MySql,
    SqliteFile,
    SqliteMemory,
}

impl DbKind {
    pub fn from_url(url: &str) -> Result<Self, DbInfraError> {
        let url = url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(DbKind::Postgres)
        } else if url.starts_with("mysql://") {
            Ok(DbKind::MySql)
        } else if url.starts_with("sqlite:") {
            if url.contains(":memory:") || url.contains("mode=memory") {
                Ok(DbKind::SqliteMemory)
            } else {
                Ok(DbKind::SqliteFile)
            }
        } else {
            Err(DbInfraError::config(format!(
                "unsupported connection string scheme: '{}'",
                sanitize_db_url(url)
            )))
        }
    }
}

impl From<DbKind> for DatabaseBackend {
    fn from(kind: DbKind) -> Self {
        match kind {
            DbKind::Postgres => DatabaseBackend::Postgres,
            DbKind::MySql => DatabaseBackend::MySql,
            DbKind::SqliteFile | DbKind::SqliteMemory => DatabaseBackend::Sqlite,
        }
    }
}

/// Deployment environment name, e.g. `Development` or `Production`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv(String);

impl RuntimeEnv {
    pub fn new(name: impl Into<String>) -> Result<Self, DbInfraError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(DbInfraError::config(format!(
                "invalid environment name '{name}': use letters, digits, '-' or '_'"
            )));
        }
        Ok(Self(name))
    }

    /// Reads [`ENVIRONMENT_VAR`]; an unset variable is an error, never a default.
    pub fn from_process_env() -> Result<Self, DbInfraError> {
        let name = env::var(ENVIRONMENT_VAR).map_err(|_| {
            DbInfraError::config(format!("{ENVIRONMENT_VAR} is not set"))
        })?;
        Self::new(name)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn settings_file_name(&self) -> String {
        format!("appsettings.{}.json", self.0)
    }
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AppSettings {
    db_settings: DbSettings,
}

/// The `DbSettings` section of an appsettings file.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DbSettings {
    pub migration_connection_string: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_body_timeout_ms")]
    pub body_timeout_ms: u64,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_body_timeout_ms() -> u64 {
    DEFAULT_BODY_TIMEOUT_MS
}

impl DbSettings {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            migration_connection_string: connection_string.into(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            body_timeout_ms: DEFAULT_BODY_TIMEOUT_MS,
            ledger: LedgerConfig::default(),
        }
    }

    pub fn db_kind(&self) -> Result<DbKind, DbInfraError> {
        DbKind::from_url(&self.migration_connection_string)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_millis(self.body_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), DbInfraError> {
        if self.migration_connection_string.trim().is_empty() {
            return Err(DbInfraError::config(
                "DbSettings.MigrationConnectionString is empty",
            ));
        }
        self.db_kind()?;
        if self.body_timeout_ms == 0 {
            return Err(DbInfraError::config(
                "DbSettings.BodyTimeoutMs must be greater than zero",
            ));
        }
        self.ledger.validate()
    }
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field(
                "migration_connection_string",
                &sanitize_db_url(&self.migration_connection_string),
            )
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("body_timeout_ms", &self.body_timeout_ms)
            .field("ledger", &self.ledger)
            .finish()
    }
}

/// Parse and validate an appsettings document. `source` only labels errors.
pub fn parse_settings(json: &str, source: &str) -> Result<DbSettings, DbInfraError> {
    let settings: AppSettings = serde_json::from_str(json)
        .map_err(|e| DbInfraError::config(format!("failed to parse {source}: {e}")))?;
    settings.db_settings.validate()?;
    Ok(settings.db_settings)
}

/// Load `appsettings.{Env}.json` from `config_dir`.
pub fn load_settings(env: &RuntimeEnv, config_dir: &Path) -> Result<DbSettings, DbInfraError> {
    let path = config_dir.join(env.settings_file_name());
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        DbInfraError::config(format!("failed to read {}: {e}", path.display()))
    })?;
    parse_settings(&raw, &path.display().to_string())
}

/// Lock file shared by every process migrating the same SQLite database:
/// `<db file>.migrate.lock`.
pub fn sqlite_lock_path(url: &str) -> Result<PathBuf, DbInfraError> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .ok_or_else(|| DbInfraError::config(format!("not a sqlite url: '{url}'")))?;
    let file = rest.split('?').next().unwrap_or_default();
    if file.is_empty() || file.contains(":memory:") {
        return Err(DbInfraError::config(
            "sqlite lock path requires a file-backed database",
        ));
    }
    Ok(PathBuf::from(format!("{file}.migrate.lock")))
}
