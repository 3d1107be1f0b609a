/// Process-local counters for the migration path. Logged once per
/// orchestration through [`migration_counters::log_snapshot`].
pub mod migration_counters {
    use std::sync::atomic::{AtomicUsize, Ordering};

    macro_rules! counters {
        ($($field:ident),* $(,)?) => {
            struct Counters {
                $($field: AtomicUsize,)*
            }

            static COUNTERS: Counters = Counters {
                $($field: AtomicUsize::new(0),)*
            };

            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
            pub struct Snapshot {
                $(pub $field: usize,)*
            }

            pub fn snapshot() -> Snapshot {
                Snapshot {
                    $($field: COUNTERS.$field.load(Ordering::Relaxed),)*
                }
            }
        };
    }

    counters!(
        schema_checks,
        fast_path_hits,
        fast_path_misses,
        lock_acquire_attempts,
        lock_backoff_events,
        locks_acquired,
        lock_acquire_timeouts,
        migrations_applied,
        migrations_failed,
        body_timeouts,
        cancellations,
        postcheck_mismatches,
        hook_failures,
    );

    fn bump(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn schema_check() {
        bump(&COUNTERS.schema_checks, 1);
    }

    pub fn fast_path_hit() {
        bump(&COUNTERS.fast_path_hits, 1);
    }

    pub fn fast_path_miss() {
        bump(&COUNTERS.fast_path_misses, 1);
    }

    pub fn add_lock_acquire_attempts(n: usize) {
        bump(&COUNTERS.lock_acquire_attempts, n);
    }

    pub fn lock_backoff_event() {
        bump(&COUNTERS.lock_backoff_events, 1);
    }

    pub fn lock_acquired() {
        bump(&COUNTERS.locks_acquired, 1);
    }

    pub fn lock_acquire_timeout() {
        bump(&COUNTERS.lock_acquire_timeouts, 1);
    }

    pub fn migration_applied() {
        bump(&COUNTERS.migrations_applied, 1);
    }

    pub fn migration_failed() {
        bump(&COUNTERS.migrations_failed, 1);
    }

    pub fn migration_body_timeout() {
        bump(&COUNTERS.body_timeouts, 1);
    }

    pub fn migration_cancelled() {
        bump(&COUNTERS.cancellations, 1);
    }

    pub fn postcheck_mismatch() {
        bump(&COUNTERS.postcheck_mismatches, 1);
    }

    pub fn hook_failed() {
        bump(&COUNTERS.hook_failures, 1);
    }

    pub fn log_snapshot(context: &str) {
        let s = snapshot();
        tracing::info!(
            context = context,
            fast_path_hits = s.fast_path_hits,
            fast_path_misses = s.fast_path_misses,
            lock_acquire_attempts = s.lock_acquire_attempts,
            lock_acquire_timeouts = s.lock_acquire_timeouts,
            migrations_applied = s.migrations_applied,
            migrations_failed = s.migrations_failed,
            hook_failures = s.hook_failures,
            counters = ?s,
            "db_migration_counters_snapshot"
        );
    }

}
