//! Per-target connection wrapper.
//!
//! A `Target` owns the lazy attachment to its local database: the applier
//! is created on first use within a sweep cycle, survives across sweeps
//! while progress is being made (open replica transactions must outlive a
//! single sweep), and is torn down after any sweep that made no progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shadow_apply::{Applier, FallbackKeys};
use shadow_core::{Result, ShadowError};
use shadow_storage::ReplicaDatabase;
use tracing::{debug, error};

use crate::config::TargetConfig;

/// How a worker attaches to its local database.
///
/// Tests hand in closures producing in-memory engines; production glue
/// connects to the real engine.
pub trait DatabaseProvider: Send {
    /// Open a fresh attachment.
    fn attach(&self) -> Result<Box<dyn ReplicaDatabase>>;
}

impl<F> DatabaseProvider for F
where
    F: Fn() -> Result<Box<dyn ReplicaDatabase>> + Send,
{
    fn attach(&self) -> Result<Box<dyn ReplicaDatabase>> {
        self()
    }
}

/// One replication target: configuration plus connection state.
pub struct Target {
    config: TargetConfig,
    provider: Box<dyn DatabaseProvider>,
    applier: Option<Applier>,
    db_sequence: u64,
    last_error: Option<String>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Target {
    /// Create a disconnected target.
    pub fn new(config: TargetConfig, provider: Box<dyn DatabaseProvider>) -> Self {
        Target {
            config,
            provider,
            applier: None,
            db_sequence: 0,
            last_error: None,
            cancel: None,
        }
    }

    /// Install the flag consulted by [`Target::check_cancelled`].
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// Cooperative cancellation point, checked between blocks.
    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Acquire) => Err(ShadowError::Cancelled),
            _ => Ok(()),
        }
    }

    /// The target's configuration.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Connect if necessary and return the master database sequence the
    /// replica reported at connect time.
    pub fn init_replica(&mut self) -> Result<u64> {
        if self.applier.is_some() {
            return Ok(self.db_sequence);
        }

        self.verbose(format!("connecting to database ({})", self.config.name));

        let db = self.provider.attach()?;
        let db_sequence = db.replication_sequence()?;

        let applier = Applier::new(
            db,
            FallbackKeys::default(),
            self.config.conflict_policy,
        )?;

        self.applier = Some(applier);
        self.db_sequence = db_sequence;
        Ok(db_sequence)
    }

    /// Apply one block through the attachment.
    pub fn replicate(&mut self, block: &[u8]) -> Result<()> {
        let applier = self
            .applier
            .as_mut()
            .ok_or_else(|| ShadowError::Engine("target is not connected".into()))?;
        applier.process(block)
    }

    /// True while the target has no open attachment.
    pub fn is_shutdown(&self) -> bool {
        self.applier.is_none()
    }

    /// True while the attachment holds open replica transactions.
    pub fn has_open_transactions(&self) -> bool {
        self.applier
            .as_ref()
            .is_some_and(Applier::has_open_transactions)
    }

    /// Disconnect: roll back open replica transactions and drop the
    /// attachment.
    pub fn shutdown(&mut self) {
        if let Some(mut applier) = self.applier.take() {
            self.verbose(format!(
                "disconnecting from database ({})",
                self.config.name
            ));
            applier.shutdown();
        }
        self.db_sequence = 0;
    }

    /// Log an error once: identical consecutive messages are suppressed
    /// until a different one appears.
    pub fn log_error(&mut self, message: &str) {
        if self.last_error.as_deref() == Some(message) {
            return;
        }

        error!(
            target: "shadow::replica",
            database = %self.config.name,
            "{message}"
        );
        self.last_error = Some(message.to_owned());
    }

    /// Trace a per-decision message when verbose logging is configured.
    pub fn verbose(&self, message: String) {
        if self.config.verbose {
            debug!(
                target: "shadow::replica",
                database = %self.config.name,
                "{message}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_storage::MemoryEngine;

    fn target_over(engine: MemoryEngine) -> Target {
        let provider = move || -> Result<Box<dyn ReplicaDatabase>> { Ok(Box::new(engine.clone())) };
        Target::new(TargetConfig::new("t", "/tmp/nowhere"), Box::new(provider))
    }

    #[test]
    fn init_replica_caches_db_sequence() {
        let engine = MemoryEngine::new();
        engine.set_replication_sequence(7);

        let mut target = target_over(engine.clone());
        assert!(target.is_shutdown());

        assert_eq!(target.init_replica().unwrap(), 7);
        assert!(!target.is_shutdown());

        // The cached value is returned even if the engine moved on.
        engine.set_replication_sequence(9);
        assert_eq!(target.init_replica().unwrap(), 7);

        // Reconnecting after a shutdown observes the new value.
        target.shutdown();
        assert_eq!(target.init_replica().unwrap(), 9);
    }

    #[test]
    fn connect_to_non_replica_database_is_fatal() {
        let engine = MemoryEngine::new();
        engine.set_replica_mode(false);

        let mut target = target_over(engine);
        let err = target.init_replica().unwrap_err();
        assert!(err.is_fatal());
        assert!(target.is_shutdown());
    }

    #[test]
    fn shutdown_rolls_back_open_transactions() {
        use shadow_journal::testing::BlockBuilder;
        use shadow_journal::BLOCK_BEGIN_TRANS;

        let engine = MemoryEngine::new();
        let mut target = target_over(engine.clone());
        target.init_replica().unwrap();

        target
            .replicate(
                &BlockBuilder::new(11, BLOCK_BEGIN_TRANS)
                    .op_start_transaction()
                    .build(),
            )
            .unwrap();
        assert!(target.has_open_transactions());
        assert_eq!(engine.open_transactions(), 1);

        target.shutdown();
        assert_eq!(engine.open_transactions(), 0);
        assert!(!target.has_open_transactions());
    }
}
