//! Cleanup that must happen before the process goes away.
//!
//! Hooks run newest first, either explicitly through [`ExitHooks::run_all`] at
//! an orderly shutdown or, as a last resort, synchronously when the last
//! handle to the registry is dropped.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait ExitHook: Send + Sync {
    async fn run(&self);

    /// Used when nothing can be awaited anymore. Best effort.
    fn run_blocking(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Lets a hook remove itself once it has run. Holds the registry weakly, so a
/// hook storing its own registration does not keep the registry alive.
#[derive(Clone)]
pub struct HookRegistration {
    hooks: Weak<Inner>,
    id: HookId,
}

impl HookRegistration {
    pub fn id(&self) -> HookId {
        self.id
    }

    /// No-op once the registry is gone.
    pub fn unregister(&self) -> bool {
        match self.hooks.upgrade() {
            Some(inner) => ExitHooks { inner }.unregister(self.id),
            None => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ExitHooks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    hooks: Mutex<Vec<(HookId, Arc<dyn ExitHook>)>>,
    next_id: AtomicU64,
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn ExitHook>) -> HookId {
        let id = HookId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().push((id, hook));
        debug!(?id, "registered exit hook");
        id
    }

    pub fn registration(&self, id: HookId) -> HookRegistration {
        HookRegistration {
            hooks: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Returns whether `id` was still registered.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.inner.lock();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs and removes every registered hook.
    pub async fn run_all(&self) {
        let hooks = std::mem::take(&mut *self.inner.lock());
        for (id, hook) in hooks.into_iter().rev() {
            debug!(?id, "running exit hook");
            hook.run().await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<(HookId, Arc<dyn ExitHook>)>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let hooks = std::mem::take(&mut *self.lock());
        for (_, hook) in hooks.into_iter().rev() {
            hook.run_blocking();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ExitHook for Recorder {
        async fn run(&self) {
            self.log
                .lock()
                .expect("lock")
                .push(format!("async:{}", self.name));
        }

        fn run_blocking(&self) {
            self.log
                .lock()
                .expect("lock")
                .push(format!("blocking:{}", self.name));
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn ExitHook> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn run_all_runs_newest_first_and_only_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = ExitHooks::new();
        hooks.register(recorder("first", &log));
        hooks.register(recorder("second", &log));

        hooks.run_all().await;
        hooks.run_all().await;
        drop(hooks);

        assert_eq!(
            *log.lock().expect("lock"),
            vec!["async:second".to_string(), "async:first".to_string()]
        );
    }

    #[test]
    fn dropping_the_last_handle_runs_remaining_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = ExitHooks::new();
        hooks.register(recorder("kept", &log));
        let removed = hooks.register(recorder("removed", &log));
        assert!(hooks.unregister(removed));
        assert!(!hooks.unregister(removed));

        let clone = hooks.clone();
        drop(hooks);
        assert!(log.lock().expect("lock").is_empty());
        assert_eq!(clone.len(), 1);
        drop(clone);

        assert_eq!(*log.lock().expect("lock"), vec!["blocking:kept".to_string()]);
    }

    #[test]
    fn registration_removes_the_hook_without_keeping_the_registry_alive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = ExitHooks::new();
        let id = hooks.register(recorder("once", &log));
        let registration = hooks.registration(id);
        assert_eq!(registration.id(), id);

        assert!(registration.unregister());
        assert!(hooks.is_empty());
        assert!(!registration.unregister());

        let id = hooks.register(recorder("dropped", &log));
        let registration = hooks.registration(id);
        drop(hooks);
        assert_eq!(
            *log.lock().expect("lock"),
            vec!["blocking:dropped".to_string()]
        );
        assert!(!registration.unregister());
    }
}
