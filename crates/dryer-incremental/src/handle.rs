//! Shared, per-instance locked access to a [`ModelSession`].
//!
//! Training and cross-validation run on a background thread. At most one run
//! per handle is active at a time; different handles run independently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};

use burn::tensor::backend::AutodiffBackend;
use dryer_core::{Error, Result};
use dryer_features::TrainingSetRegistry;
use dryer_training::{CrossValidationReport, TrainingOutcome};
use tracing::{debug, info};

use crate::session::ModelSession;

pub struct ModelHandle<B: AutodiffBackend> {
    session: Arc<Mutex<ModelSession<B>>>,
    running: Arc<AtomicBool>,
}

impl<B: AutodiffBackend> Clone for ModelHandle<B> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            running: Arc::clone(&self.running),
        }
    }
}

/// A run executing on its own thread.
pub struct BackgroundRun<T> {
    label: &'static str,
    worker: JoinHandle<Result<T>>,
}

impl<T> BackgroundRun<T> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the run and returns its result.
    pub fn join(self) -> Result<T> {
        self.worker
            .join()
            .map_err(|_| Error::Model(format!("{} worker panicked", self.label)))?
    }
}

/// Clears the running flag when the worker ends, panics included.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: AutodiffBackend> ModelHandle<B> {
    pub fn new(session: ModelSession<B>) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs `f` on the session, waiting for any active run to finish first.
    pub fn with_session<T>(&self, f: impl FnOnce(&mut ModelSession<B>) -> T) -> T {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut session)
    }

    /// Runs `f` on the session, or fails with `ModelState` while it is busy.
    pub fn try_with_session<T>(&self, f: impl FnOnce(&mut ModelSession<B>) -> T) -> Result<T> {
        match self.session.try_lock() {
            Ok(mut session) => Ok(f(&mut session)),
            Err(TryLockError::Poisoned(poisoned)) => Ok(f(&mut poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => Err(busy()),
        }
    }

    pub fn spawn_train(&self, sets: TrainingSetRegistry) -> Result<BackgroundRun<TrainingOutcome>> {
        self.spawn("training", move |session| session.train(&sets))
    }

    pub fn spawn_cross_validate(
        &self,
        sets: TrainingSetRegistry,
    ) -> Result<BackgroundRun<CrossValidationReport>> {
        self.spawn("cross-validation", move |session| session.cross_validate(&sets))
    }

    fn spawn<T, F>(&self, label: &'static str, job: F) -> Result<BackgroundRun<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut ModelSession<B>) -> Result<T> + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(busy());
        }
        let guard = RunGuard(Arc::clone(&self.running));
        let session = Arc::clone(&self.session);

        let worker = thread::Builder::new()
            .name(format!("dryer-{}", label.replace(' ', "-")))
            .spawn(move || {
                let _guard = guard;
                let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                debug!(run = label, "worker acquired session");
                let result = job(&mut session);
                info!(run = label, ok = result.is_ok(), "background run finished");
                result
            })?;

        Ok(BackgroundRun { label, worker })
    }
}

fn busy() -> Error {
    Error::ModelState("busy: a training run is already active on this model".to_string())
}
