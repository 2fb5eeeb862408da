//! Worker supervision: one long-lived thread per target.
//!
//! Workers share exactly two pieces of process-wide state: the shutdown
//! flag and the active-worker counter. Everything else is owned by the
//! worker's own `Target`. A worker loops sweeps while progress is being
//! made, disconnects after any sweep that did not, sleeps with idle or
//! error backoff, and exits on shutdown or on a fatal error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::engine::{process_archive, SweepStatus};
use crate::target::Target;

/// Supervisor over all replication workers.
pub struct ReplicaServer {
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl ReplicaServer {
    /// Spawn one worker thread per target.
    ///
    /// Workers are named `shadow-repl-<target>`.
    pub fn start(targets: Vec<Target>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(targets.len());
        for mut target in targets {
            active.fetch_add(1, Ordering::SeqCst);
            target.set_cancel_flag(Arc::clone(&shutdown));

            let shutdown_flag = Arc::clone(&shutdown);
            let active_count = Arc::clone(&active);
            let name = format!("shadow-repl-{}", target.config().name);

            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    worker_loop(&mut target, &shutdown_flag);
                    active_count.fetch_sub(1, Ordering::SeqCst);
                })
                .expect("failed to spawn replication worker thread");

            workers.push(handle);
        }

        ReplicaServer {
            shutdown,
            active,
            workers,
        }
    }

    /// Number of workers still running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The shared shutdown flag, for signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Signal shutdown and join every worker.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(target: &mut Target, shutdown: &AtomicBool) {
    info!(
        target: "shadow::replica",
        database = %target.config().name,
        "started replication thread"
    );

    while !shutdown.load(Ordering::Acquire) {
        let status = process_archive(target);

        if status == SweepStatus::Continue {
            continue;
        }

        target.shutdown();

        if status == SweepStatus::Fatal {
            break;
        }

        if !shutdown.load(Ordering::Acquire) {
            let timeout = match status {
                SweepStatus::Suspend => target.config().idle_timeout(),
                _ => target.config().error_timeout(),
            };

            target.verbose(format!(
                "going to sleep for {} seconds",
                timeout.as_secs()
            ));
            sleep_with_shutdown(timeout, shutdown);
        }
    }

    target.shutdown();

    info!(
        target: "shadow::replica",
        database = %target.config().name,
        "finished replication thread"
    );
}

/// Sleep in slices so a shutdown request is honored promptly.
fn sleep_with_shutdown(duration: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(100);

    let mut remaining = duration;
    while !remaining.is_zero() && !shutdown.load(Ordering::Acquire) {
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::target::DatabaseProvider;
    use shadow_journal::testing::{BlockBuilder, SegmentBuilder};
    use shadow_journal::{BLOCK_BEGIN_TRANS, BLOCK_END_TRANS};
    use shadow_storage::{
        FieldDescriptor, FieldKind, MemoryEngine, ReplicaDatabase, Value,
    };
    use std::time::Instant;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn engine_with_orders() -> MemoryEngine {
        let engine = MemoryEngine::new();
        let rel = engine.define_relation("ORDERS", false);
        engine.add_format(
            rel,
            vec![
                FieldDescriptor::new("ID", FieldKind::Int),
                FieldDescriptor::new("NAME", FieldKind::Text { length: 8 }),
            ],
        );
        engine.add_index(rel, vec![0], true, true);
        engine
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn worker_replays_and_shuts_down() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let engine = engine_with_orders();
        let rel = engine.lookup_relation("ORDERS").unwrap().id;

        let image = {
            let format = engine.current_format(rel).unwrap();
            format
                .encode(&[Some(Value::Int(1)), Some(Value::Text("a".into()))])
                .unwrap()
        };

        SegmentBuilder::new(guid, 1)
            .block(
                BlockBuilder::new(7, BLOCK_BEGIN_TRANS | BLOCK_END_TRANS)
                    .op_start_transaction()
                    .op_insert_record("ORDERS", &image)
                    .op_commit_transaction()
                    .build(),
            )
            .write_to(dir.path())
            .unwrap();

        let provider_engine = engine.clone();
        let provider = move || -> shadow_core::Result<Box<dyn ReplicaDatabase>> {
            Ok(Box::new(provider_engine.clone()))
        };
        let provider: Box<dyn DatabaseProvider> = Box::new(provider);

        let config = TargetConfig::new("worker-test", dir.path())
            .with_source_guid(guid)
            .with_idle_timeout(1);
        let server = ReplicaServer::start(vec![Target::new(config, provider)]);
        assert_eq!(server.active_workers(), 1);

        assert!(wait_until(Duration::from_secs(5), || {
            !engine.committed_rows(rel).is_empty()
        }));

        server.shutdown();
    }

    #[test]
    fn fatal_error_terminates_the_worker() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let engine = engine_with_orders();
        engine.set_replica_mode(false);

        SegmentBuilder::new(guid, 1)
            .block(
                BlockBuilder::new(7, BLOCK_BEGIN_TRANS | BLOCK_END_TRANS)
                    .op_start_transaction()
                    .op_commit_transaction()
                    .build(),
            )
            .write_to(dir.path())
            .unwrap();

        let provider_engine = engine.clone();
        let provider = move || -> shadow_core::Result<Box<dyn ReplicaDatabase>> {
            Ok(Box::new(provider_engine.clone()))
        };
        let provider: Box<dyn DatabaseProvider> = Box::new(provider);

        let config = TargetConfig::new("fatal-test", dir.path()).with_source_guid(guid);
        let server = ReplicaServer::start(vec![Target::new(config, provider)]);

        // The worker exits on its own; no shutdown signal needed.
        assert!(wait_until(Duration::from_secs(5), || {
            server.active_workers() == 0
        }));

        server.shutdown();
    }

    #[test]
    fn shutdown_interrupts_idle_sleep_promptly() {
        let dir = tempdir().unwrap();
        let engine = engine_with_orders();

        let provider_engine = engine.clone();
        let provider = move || -> shadow_core::Result<Box<dyn ReplicaDatabase>> {
            Ok(Box::new(provider_engine.clone()))
        };
        let provider: Box<dyn DatabaseProvider> = Box::new(provider);

        // An empty directory sends the worker into a long idle sleep.
        let config = TargetConfig::new("idle-test", dir.path()).with_idle_timeout(3600);
        let server = ReplicaServer::start(vec![Target::new(config, provider)]);

        std::thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        server.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
