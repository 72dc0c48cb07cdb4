//! Background polling runtime wrapping a [`ReconcileEngine`].
//!
//! One worker thread runs poll cycles on an interval; readers take cheap
//! snapshot clones from an `RwLock` that is only ever written after a
//! complete cycle, so a snapshot never shows a half-reconciled view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{EngineSnapshot, ReconcileEngine};
use crate::error::Result;

/// How long `stop()` waits for the worker to finish its current cycle
/// before detaching it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    engine: Mutex<ReconcileEngine>,
    snapshot: RwLock<EngineSnapshot>,
    stop_flag: AtomicBool,
    // Pair used to interrupt the inter-cycle sleep on stop().
    stop_mutex: Mutex<()>,
    stop_signal: Condvar,
}

pub struct EngineRuntime {
    shared: Arc<Shared>,
    interval: Duration,
    worker: Option<JoinHandle<()>>,
}

impl EngineRuntime {
    pub fn new(engine: ReconcileEngine, interval: Duration) -> Self {
        EngineRuntime {
            shared: Arc::new(Shared {
                engine: Mutex::new(engine),
                snapshot: RwLock::new(EngineSnapshot::default()),
                stop_flag: AtomicBool::new(false),
                stop_mutex: Mutex::new(()),
                stop_signal: Condvar::new(),
            }),
            interval,
            worker: None,
        }
    }

    /// Spawns the worker thread. Idempotent: a second call while running is
    /// a no-op.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            debug!("Runtime already started");
            return;
        }
        self.shared.stop_flag.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("warden-poll".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "Poll worker started");
                while !shared.stop_flag.load(Ordering::SeqCst) {
                    run_cycle(&shared);
                    // Interruptible sleep: stop() notifies the condvar.
                    let guard = match shared.stop_mutex.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    let _unused = shared
                        .stop_signal
                        .wait_timeout_while(guard, interval, |_| {
                            !shared.stop_flag.load(Ordering::SeqCst)
                        });
                }
                info!("Poll worker stopped");
            });
        match handle {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => warn!(error = %err, "Failed to spawn poll worker"),
        }
    }

    /// Signals the worker to stop and waits (bounded) for its current cycle
    /// to finish. A worker stuck past the timeout is detached, not killed.
    pub fn stop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        self.shared.stop_signal.notify_all();

        let Some(handle) = self.worker.take() else {
            return;
        };
        let (done_tx, done_rx) = mpsc::channel();
        let joiner = thread::spawn(move || {
            let result = handle.join();
            let _ = done_tx.send(result.is_ok());
        });
        match done_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(true) => debug!("Poll worker joined cleanly"),
            Ok(false) => warn!("Poll worker panicked"),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                warn!("Poll worker did not stop in time; detaching");
            }
        }
        let _ = joiner;
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && !self.shared.stop_flag.load(Ordering::SeqCst)
    }

    /// Runs one cycle synchronously on the caller's thread and publishes
    /// the result. Serialized with the background worker via the engine
    /// lock.
    pub fn force_poll(&self) -> Result<EngineSnapshot> {
        let result = {
            let mut engine = match self.shared.engine.lock() {
                Ok(engine) => engine,
                Err(poisoned) => poisoned.into_inner(),
            };
            let result = engine.poll_cycle();
            publish(&self.shared, engine.snapshot());
            result
        };
        result?;
        Ok(self.snapshot())
    }

    /// Latest complete-cycle snapshot. Cheap clone; never blocks on a cycle
    /// in progress.
    pub fn snapshot(&self) -> EngineSnapshot {
        match self.shared.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_cycle(shared: &Shared) {
    let mut engine = match shared.engine.lock() {
        Ok(engine) => engine,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(err) = engine.poll_cycle() {
        warn!(error = %err, "Poll cycle failed");
    }
    // Partial results and recent errors are still worth publishing.
    publish(shared, engine.snapshot());
}

fn publish(shared: &Shared, snapshot: EngineSnapshot) {
    match shared.snapshot.write() {
        Ok(mut slot) => *slot = snapshot,
        Err(poisoned) => *poisoned.into_inner() = snapshot,
    }
}
