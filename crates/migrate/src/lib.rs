//! Schema migrations for vitalstore
//!
//! The stored schema version lives in the meta store. Registered
//! migrations declare `from → to`, run in `from` order, and each passes
//! through the same gauntlet:
//!
//! 1. downgrade gate: a stored version newer than the app is a hard
//!    startup error,
//! 2. full box backup (skippable in tests),
//! 3. dry run; refusal aborts before anything is touched,
//! 4. apply,
//! 5. schema verification; failure attempts rollback, and if that also
//!    fails the backups stay on disk and the error propagates,
//! 6. version bump plus a per-migration ack record that prevents
//!    re-execution.

#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use vital_storage::{meta_keys, MetaStore, StorageEngine, StorageError};

/// Migration errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The stored schema is newer than this build; downgrade is blocking
    #[error("stored schema version {stored} is newer than app version {current}; refusing to downgrade")]
    PolicyViolation {
        /// Version found in the meta store
        stored: u32,
        /// Version this build understands
        current: u32,
    },

    /// The dry run refused the migration
    #[error("migration '{id}' dry run refused: {reasons:?}")]
    DryRunRefused {
        /// Migration id
        id: String,
        /// Errors collected by the dry run
        reasons: Vec<String>,
    },

    /// Schema verification failed after apply
    #[error("migration '{id}' failed verification (rolled back: {rolled_back})")]
    VerifyFailed {
        /// Migration id
        id: String,
        /// Whether rollback completed
        rolled_back: bool,
    },

    /// Rollback itself failed; backups remain on disk
    #[error("migration '{id}' rollback failed: {cause}")]
    RollbackFailed {
        /// Migration id
        id: String,
        /// Rollback failure cause
        cause: String,
    },

    /// Migration does not implement rollback
    #[error("migration '{0}' does not support rollback")]
    RollbackUnsupported(String),

    /// Migration-specific failure
    #[error("migration failed: {0}")]
    Failed(String),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result alias for migrations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Outcome of a dry run.
#[derive(Debug, Clone, Default)]
pub struct DryRunReport {
    /// Whether the migration may proceed
    pub can_migrate: bool,
    /// Records the apply pass would touch
    pub records_to_migrate: usize,
    /// Non-blocking observations
    pub warnings: Vec<String>,
    /// Blocking problems
    pub errors: Vec<String>,
}

/// What a migration sees: the engine and the meta store.
pub struct MigrationContext {
    /// The storage engine with every registered box open
    pub engine: Arc<StorageEngine>,
    /// The meta store
    pub meta: MetaStore,
}

/// One schema migration.
pub trait Migration: Send + Sync {
    /// Unique id; also the backup suffix and the ack key.
    fn id(&self) -> &str;

    /// Schema version this migration upgrades from.
    fn from_version(&self) -> u32;

    /// Schema version this migration produces.
    fn to_version(&self) -> u32;

    /// Boxes the apply pass touches.
    fn affected_boxes(&self) -> Vec<String>;

    /// Inspect without mutating.
    fn dry_run(&self, ctx: &MigrationContext) -> Result<DryRunReport>;

    /// Perform the migration.
    fn apply(&self, ctx: &MigrationContext) -> Result<()>;

    /// Check the post-apply state.
    fn verify_schema(&self, ctx: &MigrationContext) -> Result<bool>;

    /// Undo the migration; optional.
    fn rollback(&self, _ctx: &MigrationContext) -> Result<()> {
        Err(MigrationError::RollbackUnsupported(self.id().to_string()))
    }

    /// Whether [`Migration::rollback`] is implemented.
    fn supports_rollback(&self) -> bool {
        false
    }
}

/// Ack record written per applied migration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationAck {
    /// Migration id
    pub id: String,
    /// When the migration completed
    pub applied_at: DateTime<Utc>,
    /// Version it produced
    pub to_version: u32,
}

/// The migration runner.
pub struct MigrationRunner {
    ctx: MigrationContext,
    migrations: Vec<Box<dyn Migration>>,
    app_schema_version: u32,
    skip_backups: bool,
}

impl MigrationRunner {
    /// Build a runner for the app's current schema version.
    pub fn new(engine: Arc<StorageEngine>, meta: MetaStore, app_schema_version: u32) -> Self {
        MigrationRunner {
            ctx: MigrationContext { engine, meta },
            migrations: Vec::new(),
            app_schema_version,
            skip_backups: false,
        }
    }

    /// Register a migration.
    pub fn register(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Skip the pre-migration backup pass (tests only).
    pub fn skip_backups(mut self, skip: bool) -> Self {
        self.skip_backups = skip;
        self
    }

    /// Run every applicable migration in `from` order.
    ///
    /// Returns the ids that were applied. A fresh install (no stored
    /// version) is stamped with the current app version and runs
    /// nothing.
    pub fn run(mut self) -> Result<Vec<String>> {
        let stored = self.ctx.meta.schema_version();
        if stored > self.app_schema_version {
            return Err(MigrationError::PolicyViolation {
                stored,
                current: self.app_schema_version,
            });
        }
        if stored == 0 {
            self.ctx.meta.set_schema_version(self.app_schema_version);
            tracing::info!(
                version = self.app_schema_version,
                "fresh install; schema stamped at current version"
            );
            return Ok(Vec::new());
        }

        self.migrations.sort_by_key(|m| m.from_version());
        let mut current = stored;
        let mut applied = Vec::new();
        let migrations = std::mem::take(&mut self.migrations);
        for migration in &migrations {
            if migration.from_version() != current
                || migration.to_version() > self.app_schema_version
            {
                continue;
            }
            if self.already_acked(migration.id()) {
                tracing::debug!(id = %migration.id(), "migration already applied; skipping");
                current = migration.to_version();
                continue;
            }
            self.run_one(migration.as_ref())?;
            current = migration.to_version();
            applied.push(migration.id().to_string());
        }
        Ok(applied)
    }

    fn run_one(&self, migration: &dyn Migration) -> Result<()> {
        let id = migration.id();
        tracing::info!(
            id = %id,
            from = migration.from_version(),
            to = migration.to_version(),
            boxes = ?migration.affected_boxes(),
            "running migration"
        );

        if !self.skip_backups {
            self.ctx.engine.backup_all(id)?;
        }

        let report = migration.dry_run(&self.ctx)?;
        for warning in &report.warnings {
            tracing::warn!(id = %id, warning = %warning, "migration dry-run warning");
        }
        if !report.can_migrate {
            return Err(MigrationError::DryRunRefused {
                id: id.to_string(),
                reasons: report.errors,
            });
        }

        migration.apply(&self.ctx)?;

        if !migration.verify_schema(&self.ctx)? {
            tracing::error!(id = %id, "migration verification failed");
            if migration.supports_rollback() {
                match migration.rollback(&self.ctx) {
                    Ok(()) => {
                        return Err(MigrationError::VerifyFailed {
                            id: id.to_string(),
                            rolled_back: true,
                        });
                    }
                    Err(e) => {
                        // Backups from step 2 stay on disk for manual repair.
                        return Err(MigrationError::RollbackFailed {
                            id: id.to_string(),
                            cause: e.to_string(),
                        });
                    }
                }
            }
            return Err(MigrationError::VerifyFailed {
                id: id.to_string(),
                rolled_back: false,
            });
        }

        self.ctx.meta.set_schema_version(migration.to_version());
        self.ctx.meta.put(
            &ack_key(id),
            &MigrationAck {
                id: id.to_string(),
                applied_at: Utc::now(),
                to_version: migration.to_version(),
            },
        );
        tracing::info!(id = %id, to = migration.to_version(), "migration applied");
        Ok(())
    }

    fn already_acked(&self, id: &str) -> bool {
        self.ctx.meta.get::<MigrationAck>(&ack_key(id)).is_some()
    }
}

fn ack_key(id: &str) -> String {
    format!("{}{}", meta_keys::MIGRATION_ACK_PREFIX, id)
}
