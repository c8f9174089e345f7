//! Main entry point for vitalstore
//!
//! [`VitalStore`] composes the member crates in the startup order the
//! invariants require:
//!
//! 1. key custody (fatal if the secret store is unreachable),
//! 2. the unencrypted meta store, readable without the key so every
//!    recovery decision below can consult it,
//! 3. resume of an interrupted key rotation,
//! 4. box opening with corruption recovery, then encryption policy
//!    enforcement,
//! 5. transaction-journal replay,
//! 6. schema migrations (downgrade is a hard stop),
//! 7. queue, fast lane, safety machine, stall detector.

use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use async_trait::async_trait;
use vital_core::{
    AuditSink, CloudMirror, CoreConfig, EscalationRecord, EscalationSink, Operation, SafetyMode,
    SyncConsumer, SyncOutcome, TelemetrySink, TracingAuditSink, TracingTelemetry,
};
use vital_journal::{TransactionJournal, JOURNAL_BOX};
use vital_keys::{FileSecretStore, KeyStore, SecretStore};
use vital_migrate::{Migration, MigrationRunner};
use vital_queue::{
    queue_descriptors, EmergencyEvent, EmergencyQueue, EmergencySignal, PendingQueue, QueueState,
    EMERGENCY_OPS_BOX,
};
use vital_safety::{QueueProbe, RecoveryAction, SafetyFallback, StallDetector, StallEvent};
use vital_storage::{
    enforce_policies, resume_if_in_progress, resume_or_rotate, BoxCipher, BoxDescriptor,
    BoxRegistry, EncryptionPolicy, MetaStore, PolicyViolation, StorageEngine,
};

use crate::error::Result;
use crate::health::{HealthAggregator, HealthSnapshot};
use crate::repair::RepairToolkit;

/// Builder for [`VitalStore`].
pub struct VitalStoreBuilder {
    data_dir: Option<PathBuf>,
    secrets: Option<Arc<dyn SecretStore>>,
    consumer: Option<Arc<dyn SyncConsumer>>,
    mirror: Option<Arc<dyn CloudMirror>>,
    escalation: Option<Arc<dyn EscalationSink>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    audit: Option<Arc<dyn AuditSink>>,
    migrations: Vec<Box<dyn Migration>>,
    extra_boxes: Vec<BoxDescriptor>,
    app_schema_version: u32,
    config: CoreConfig,
}

impl VitalStoreBuilder {
    fn new() -> Self {
        VitalStoreBuilder {
            data_dir: None,
            secrets: None,
            consumer: None,
            mirror: None,
            escalation: None,
            telemetry: None,
            audit: None,
            migrations: Vec::new(),
            extra_boxes: Vec::new(),
            app_schema_version: 1,
            config: CoreConfig::default(),
        }
    }

    /// Directory for all persisted state.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Secret store (defaults to a file store under `<data>/secrets`).
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// The upstream sync consumer.
    pub fn consumer(mut self, consumer: Arc<dyn SyncConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Optional fire-and-forget cloud mirror.
    pub fn mirror(mut self, mirror: Arc<dyn CloudMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Escalation and local-alert sink.
    pub fn escalation_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = Some(sink);
        self
    }

    /// Telemetry sink.
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Audit sink for repair actions.
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register a schema migration.
    pub fn migration(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Register an app-specific box.
    pub fn register_box(mut self, descriptor: BoxDescriptor) -> Self {
        self.extra_boxes.push(descriptor);
        self
    }

    /// The schema version this build understands.
    pub fn app_schema_version(mut self, version: u32) -> Self {
        self.app_schema_version = version;
        self
    }

    /// Refuse startup on required-encryption violations.
    pub fn strict_encryption(mut self, strict: bool) -> Self {
        self.config.strict_encryption = strict;
        self
    }

    /// Override the whole configuration.
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the store.
    pub fn open(self) -> Result<VitalStore> {
        let data_dir = self.data_dir.unwrap_or_else(|| PathBuf::from("./vitalstore"));
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry));
        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let escalation = self
            .escalation
            .unwrap_or_else(|| Arc::new(vital_core::NoopEscalationSink));
        let consumer = self
            .consumer
            .unwrap_or_else(|| Arc::new(UnconfiguredConsumer));

        // Key custody first; an unreachable secret store is fatal.
        let secrets = match self.secrets {
            Some(s) => s,
            None => Arc::new(FileSecretStore::open(data_dir.join("secrets")).map_err(
                |e| vital_keys::KeyStoreError::Unavailable(e.to_string()),
            )?),
        };
        let keystore = Arc::new(KeyStore::new(secrets, telemetry.clone()));
        let key = keystore.load_or_generate()?;
        let cipher = Arc::new(BoxCipher::new(&key));

        // Registry: core boxes plus the app's own.
        let registry = Arc::new(BoxRegistry::new());
        registry.register(BoxDescriptor::new("meta", EncryptionPolicy::Forbidden, 1, 1))?;
        registry.register(BoxDescriptor::new(
            JOURNAL_BOX,
            EncryptionPolicy::Forbidden,
            2,
            1,
        ))?;
        for descriptor in queue_descriptors() {
            registry.register(descriptor)?;
        }
        for descriptor in self.extra_boxes {
            registry.register(descriptor)?;
        }

        let engine = Arc::new(StorageEngine::new(
            data_dir.clone(),
            registry,
            Some(cipher),
            telemetry.clone(),
        )?);

        // The meta store opens before anything else; its plaintext
        // readability is what recovery decisions below depend on.
        let meta = MetaStore::new(engine.open_box("meta")?);

        // A crash mid-rotation resumes before any box is read through
        // the typed codec.
        resume_if_in_progress(&engine, &meta, &keystore)?;

        let opened = engine.open_registered()?;
        let policy_violations = enforce_policies(
            engine.registry(),
            &opened,
            self.config.strict_encryption,
            &telemetry,
        )?;

        let journal = Arc::new(TransactionJournal::new(engine.clone(), telemetry.clone())?);
        let replayed = journal.recover()?;
        if replayed > 0 {
            tracing::info!(replayed, "journal recovery replayed transactions");
        }

        let mut runner = MigrationRunner::new(engine.clone(), meta.clone(), self.app_schema_version)
            .skip_backups(self.config.skip_migration_backups);
        for migration in self.migrations {
            runner = runner.register(migration);
        }
        let applied = runner.run()?;
        if !applied.is_empty() {
            tracing::info!(applied = ?applied, "schema migrations applied");
        }

        let safety = Arc::new(SafetyFallback::new(
            meta.clone(),
            self.config.safety.clone(),
            escalation.clone(),
            telemetry.clone(),
        ));

        let emergency = Arc::new(EmergencyQueue::new(
            engine.typed(EMERGENCY_OPS_BOX)?,
            self.config.queue.clone(),
            consumer.clone(),
            Arc::new(CompositeEscalation {
                host: escalation,
                safety: safety.clone(),
            }),
            Arc::new(SafetySignal(safety.clone())),
            telemetry.clone(),
        ));

        let mut queue = PendingQueue::new(
            &engine,
            journal.clone(),
            meta.clone(),
            consumer,
            self.config.queue.clone(),
            telemetry.clone(),
        )?
        .with_emergency_lane(emergency.clone());
        if let Some(mirror) = self.mirror {
            queue = queue.with_mirror(mirror);
        }
        let queue = Arc::new(queue);

        let stall = Arc::new(StallDetector::new(
            Arc::new(QueueProbeAdapter(queue.clone())),
            Arc::new(PokeQueue {
                queue: queue.clone(),
                batch: self.config.queue.batch_size,
            }),
            self.config.stall.clone(),
            telemetry.clone(),
        ));

        let health = HealthAggregator::new(
            queue.clone(),
            emergency.clone(),
            safety.clone(),
            stall.clone(),
            meta.clone(),
            policy_violations.clone(),
        );
        let repair = RepairToolkit::new(
            queue.clone(),
            engine.clone(),
            journal.clone(),
            self.config.strict_encryption,
            audit,
            telemetry,
        );

        Ok(VitalStore {
            engine,
            meta,
            journal,
            keystore,
            queue,
            emergency,
            safety,
            stall,
            health,
            repair,
            config: self.config,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The vitalstore core.
///
/// Created with [`VitalStore::builder`]; all state lives under one data
/// directory.
pub struct VitalStore {
    engine: Arc<StorageEngine>,
    meta: MetaStore,
    journal: Arc<TransactionJournal>,
    keystore: Arc<KeyStore>,
    queue: Arc<PendingQueue>,
    emergency: Arc<EmergencyQueue>,
    safety: Arc<SafetyFallback>,
    stall: Arc<StallDetector>,
    health: HealthAggregator,
    repair: RepairToolkit,
    config: CoreConfig,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for VitalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VitalStore").finish_non_exhaustive()
    }
}

impl VitalStore {
    /// Create a builder.
    pub fn builder() -> VitalStoreBuilder {
        VitalStoreBuilder::new()
    }

    /// Open a throwaway store under the system temp directory.
    ///
    /// Test convenience; the directory is not cleaned up automatically.
    pub fn open_temp(consumer: Arc<dyn SyncConsumer>) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("vitalstore-{}", Uuid::new_v4()));
        Self::builder().data_dir(dir).consumer(consumer).open()
    }

    /// Enqueue an operation; `false` means idempotency duplicate.
    pub async fn enqueue(&self, op: Operation) -> Result<bool> {
        Ok(self.queue.enqueue(op).await?)
    }

    /// Run one dispatcher pass with the configured batch size.
    pub async fn process_pending(&self) -> Result<usize> {
        self.process_pending_batch(self.config.queue.batch_size).await
    }

    /// Run one dispatcher pass with an explicit batch size.
    pub async fn process_pending_batch(&self, batch_size: usize) -> Result<usize> {
        Ok(self.queue.process(batch_size).await?)
    }

    /// Run one emergency-lane pass.
    pub async fn process_emergency(&self) -> Result<usize> {
        Ok(self.emergency.process_all().await?)
    }

    /// Complete a delivery whose acknowledgement arrived out of band.
    ///
    /// Checks the pending queue first, then the emergency lane.
    pub async fn acknowledge(&self, op_id: &str) -> Result<bool> {
        if self.queue.acknowledge(op_id).await? {
            return Ok(true);
        }
        Ok(self.emergency.acknowledge(op_id)?)
    }

    /// Start the background timers (emergency retries, stall watchdog).
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.emergency.spawn_retry_timer());
        tasks.push(self.stall.spawn());
        tracing::info!("background timers started");
    }

    /// Stop the background timers.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!("vitalstore shut down");
    }

    /// Take a health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// The repair toolkit.
    pub fn repair(&self) -> &RepairToolkit {
        &self.repair
    }

    /// Current dispatcher state.
    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    /// Lift a pause caused by an auth failure.
    pub fn resume_queue(&self) {
        self.queue.resume();
    }

    /// Current safety mode.
    pub fn safety_mode(&self) -> SafetyMode {
        self.safety.mode()
    }

    /// Operator acknowledgement of the safety fallback.
    pub fn acknowledge_safety(&self) {
        self.safety.acknowledge();
    }

    /// Report the network reachable.
    pub fn note_network_available(&self) {
        self.safety.note_network_available();
    }

    /// Report the network unreachable.
    pub fn note_network_unavailable(&self) {
        self.safety.note_network_unavailable(Utc::now());
    }

    /// Rotate the encryption key, re-encrypting every encryptable box.
    ///
    /// Idempotent across crashes; an interrupted rotation resumes at the
    /// next startup.
    pub fn rotate_encryption_key(&self) -> Result<()> {
        resume_or_rotate(&self.engine, &self.meta, &self.keystore)?;
        Ok(())
    }

    /// Subscribe to emergency-lane events.
    pub fn subscribe_emergency_events(&self) -> tokio::sync::broadcast::Receiver<EmergencyEvent> {
        self.emergency.subscribe()
    }

    /// Subscribe to stall-detector events.
    pub fn subscribe_stall_events(&self) -> tokio::sync::broadcast::Receiver<StallEvent> {
        self.stall.subscribe()
    }

    /// Run one stall-detector check immediately (admin surface).
    pub async fn check_stall_now(&self) {
        self.stall.check_once(Utc::now()).await;
    }

    /// The data directory.
    pub fn data_dir(&self) -> &Path {
        self.engine.data_dir()
    }

    /// The meta store (admin surface).
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    /// Encryption policy violations observed at startup.
    pub fn policy_violations(&self) -> Vec<PolicyViolation> {
        self.health.snapshot().policy_violations
    }

    /// Number of committed-but-unpruned journal entries.
    pub fn journal_backlog(&self) -> usize {
        self.journal.len()
    }
}

impl Drop for VitalStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Placeholder consumer for stores opened without one; every delivery
/// fails transiently until the host wires a real consumer.
struct UnconfiguredConsumer;

#[async_trait]
impl SyncConsumer for UnconfiguredConsumer {
    async fn process(&self, _op: &Operation) -> SyncOutcome {
        SyncOutcome::TransientFailure("no sync consumer configured".into())
    }
}

/// Feeds emergency outcomes into the safety machine.
struct SafetySignal(Arc<SafetyFallback>);

impl EmergencySignal for SafetySignal {
    fn emergency_success(&self) {
        self.0.note_emergency_success();
    }

    fn emergency_failure(&self, op: &Operation) {
        self.0.note_emergency_failure(Some(op));
    }
}

/// Records escalations in the safety history, then forwards to the host.
struct CompositeEscalation {
    host: Arc<dyn EscalationSink>,
    safety: Arc<SafetyFallback>,
}

impl EscalationSink for CompositeEscalation {
    fn on_escalation(&self, op: Option<&Operation>, reason: &str) {
        self.safety.note_escalated_op(op, reason);
        self.host.on_escalation(op, reason);
    }

    fn on_local_alert(&self, mode: SafetyMode, message: &str, record: &EscalationRecord) {
        self.host.on_local_alert(mode, message, record);
    }
}

/// Stall-detector view over the pending queue.
struct QueueProbeAdapter(Arc<PendingQueue>);

impl QueueProbe for QueueProbeAdapter {
    fn oldest_pending_age(&self, now: chrono::DateTime<Utc>) -> Option<Duration> {
        self.0.oldest_pending_age(now)
    }

    fn release_stale_lock(&self, now: chrono::DateTime<Utc>) -> bool {
        self.0.processing_lock().release_if_stale(now)
    }

    fn rebuild_index(&self) -> bool {
        self.0.rebuild_index().is_ok()
    }
}

/// Recovery hook: poke the dispatcher.
struct PokeQueue {
    queue: Arc<PendingQueue>,
    batch: usize,
}

#[async_trait]
impl RecoveryAction for PokeQueue {
    async fn recover(&self) {
        if let Err(e) = self.queue.process(self.batch).await {
            tracing::error!(error = %e, "recovery processing pass failed");
        }
    }
}
