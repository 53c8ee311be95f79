//! The sessions a context currently exposes to the rest of the program.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::run::RunId;
use crate::run::RunSession;

/// One active session by default; `reinit` lets several coexist. The most
/// recently published session is the current one.
#[derive(Clone, Default)]
pub struct PublishedRuns {
    runs: Arc<Mutex<Vec<RunSession>>>,
}

impl PublishedRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, run: RunSession, reinit: bool) {
        let mut runs = self.lock();
        if !reinit {
            runs.clear();
        }
        runs.retain(|existing| existing.id() != run.id());
        runs.push(run);
    }

    pub fn current(&self) -> Option<RunSession> {
        self.lock().last().cloned()
    }

    pub fn all(&self) -> Vec<RunSession> {
        self.lock().clone()
    }

    pub fn remove(&self, id: &RunId) -> bool {
        let mut runs = self.lock();
        let before = runs.len();
        runs.retain(|run| run.id() != id);
        runs.len() != before
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RunSession>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
