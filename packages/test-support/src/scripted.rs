//! A migration driven by raw SQL, with switches tests can flip between runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use migration::sea_orm::ConnectionTrait;
use migration::{DbErr, Migration, MigrationId, SchemaManager};

/// Shared log of `up` invocations, in call order.
pub type RunLog = Arc<Mutex<Vec<MigrationId>>>;

#[derive(Clone)]
pub struct ScriptedMigration {
    id: MigrationId,
    description: String,
    statements: Vec<String>,
    fail: Arc<AtomicBool>,
    delay: Option<Duration>,
    runs: Arc<AtomicUsize>,
    log: Option<RunLog>,
}

impl ScriptedMigration {
    pub fn new(id: i64, description: &str) -> Self {
        Self {
            id: MigrationId::new(id),
            description: description.to_string(),
            statements: Vec::new(),
            fail: Arc::new(AtomicBool::new(false)),
            delay: None,
            runs: Arc::new(AtomicUsize::new(0)),
            log: None,
        }
    }

    pub fn sql(mut self, statement: &str) -> Self {
        self.statements.push(statement.to_string());
        self
    }

    /// Fail after executing the statements while `flag` is set.
    pub fn fail_when(mut self, flag: Arc<AtomicBool>) -> Self {
        self.fail = flag;
        self
    }

    /// Sleep before the statements run; used to hold a transaction open.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn log_to(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of times `up` has started, shared across clones.
    pub fn runs(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

#[async_trait]
impl Migration for ScriptedMigration {
    fn id(&self) -> MigrationId {
        self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.id);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let conn = manager.get_connection();
        for statement in &self.statements {
            conn.execute_unprepared(statement).await?;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(DbErr::Migration(format!(
                "scripted failure in {}",
                self.description
            )));
        }
        Ok(())
    }
}
