//! Configuration for the persistence and synchronization core
//!
//! All timing constants live here with their canonical defaults. The
//! structs are plain data; the facade builder exposes the knobs callers
//! actually tune (data dir, strict encryption, batch size).

use std::time::Duration;

/// Queue and dispatcher configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts before a normal operation is isolated as poison
    pub max_attempts: u32,
    /// Attempts before an emergency operation escalates
    pub emergency_max_attempts: u32,
    /// Base delay for normal backoff (doubles per attempt)
    pub backoff_base: Duration,
    /// Ceiling for normal backoff
    pub backoff_cap: Duration,
    /// Base delay for emergency backoff
    pub emergency_backoff_base: Duration,
    /// Ceiling for emergency backoff
    pub emergency_backoff_cap: Duration,
    /// Operations handed to the consumer per processing pass
    pub batch_size: usize,
    /// Idempotency-cache entry lifetime
    pub idempotency_ttl: Duration,
    /// Age at which a persisted entity lock becomes reclaimable
    pub entity_lock_timeout: Duration,
    /// Age at which the processing lock becomes reclaimable
    pub processing_lock_timeout: Duration,
    /// Interval of the emergency retry timer
    pub emergency_retry_interval: Duration,
    /// Bound on the failed-op store; oldest archived entries evict first
    pub failed_store_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: 7,
            emergency_max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(600),
            emergency_backoff_base: Duration::from_secs(1),
            emergency_backoff_cap: Duration::from_secs(15),
            batch_size: 10,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            entity_lock_timeout: Duration::from_secs(5 * 60),
            processing_lock_timeout: Duration::from_secs(5 * 60),
            emergency_retry_interval: Duration::from_secs(2),
            failed_store_limit: 500,
        }
    }
}

/// Stall detector configuration.
#[derive(Debug, Clone)]
pub struct StallConfig {
    /// Oldest-op age beyond which the queue counts as stalled
    pub stall_threshold: Duration,
    /// Watchdog sampling interval
    pub check_interval: Duration,
    /// Recovery attempts before the watchdog gives up
    pub max_recovery_attempts: u32,
    /// Minimum spacing between recovery attempts
    pub recovery_cooldown: Duration,
}

impl Default for StallConfig {
    fn default() -> Self {
        StallConfig {
            stall_threshold: Duration::from_secs(10 * 60),
            check_interval: Duration::from_secs(60),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_secs(2 * 60),
        }
    }
}

/// Safety fallback configuration.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Continuous network unavailability before degrading the mode
    pub network_unavailable_threshold: Duration,
    /// Emergency failures before entering emergency mode
    pub emergency_escalation_threshold: u32,
    /// Bound on the persisted escalation history
    pub escalation_history_limit: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            network_unavailable_threshold: Duration::from_secs(5 * 60),
            emergency_escalation_threshold: 3,
            escalation_history_limit: 100,
        }
    }
}

/// Top-level configuration composed by the facade.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Queue and dispatcher settings
    pub queue: QueueConfig,
    /// Stall detector settings
    pub stall: StallConfig,
    /// Safety fallback settings
    pub safety: SafetyConfig,
    /// Refuse to start when a required-encryption box opens unencrypted
    pub strict_encryption: bool,
    /// Skip the pre-migration backup pass (test installs only)
    pub skip_migration_backups: bool,
}
