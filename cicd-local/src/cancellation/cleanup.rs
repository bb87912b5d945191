//! Cleanup registry and scoped cleanup guards.

use crate::errors::CleanupFailure;
use parking_lot::Mutex;
use tracing::{debug, warn};

type CleanupFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// A registered cleanup action.
struct CleanupCallback {
    callback: CleanupFn,
    name: String,
}

/// Registry for cleanup actions executed in LIFO order.
///
/// Actions are registered as soon as the resource they release exists, and
/// the registry is drained exactly once when the run terminates, whatever
/// the reason. A failing or panicking action is recorded and the remaining
/// actions still run.
#[derive(Default)]
pub struct CleanupRegistry {
    callbacks: Mutex<Vec<CleanupCallback>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named cleanup action.
    pub fn register<F>(&self, name: &str, callback: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        debug!(cleanup = name, "Cleanup registered");
        self.callbacks.lock().push(CleanupCallback {
            callback: Box::new(callback),
            name: name.to_string(),
        });
    }

    /// Removes every action registered under `name` without running it.
    ///
    /// Returns true if an action was removed.
    pub fn unregister_by_name(&self, name: &str) -> bool {
        let mut callbacks = self.callbacks.lock();
        let initial_len = callbacks.len();
        callbacks.retain(|cb| cb.name != name);
        callbacks.len() < initial_len
    }

    /// Runs and removes the action registered under `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns the failure of the action.
    pub fn run_named(&self, name: &str) -> Result<bool, CleanupFailure> {
        let entry = {
            let mut callbacks = self.callbacks.lock();
            callbacks
                .iter()
                .rposition(|cb| cb.name == name)
                .map(|idx| callbacks.remove(idx))
        };
        match entry {
            Some(entry) => run_one(entry).map(|()| true),
            None => Ok(false),
        }
    }

    /// Runs all cleanup actions in LIFO order and clears the registry.
    ///
    /// Failures are logged and returned; they never stop other actions.
    pub fn run_all(&self) -> Vec<CleanupFailure> {
        let callbacks: Vec<CleanupCallback> = std::mem::take(&mut *self.callbacks.lock());

        callbacks
            .into_iter()
            .rev()
            .filter_map(|entry| run_one(entry).err())
            .collect()
    }

    /// Returns the number of pending cleanup actions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Names of the pending actions in registration order.
    #[must_use]
    pub fn pending_names(&self) -> Vec<String> {
        self.callbacks.lock().iter().map(|cb| cb.name.clone()).collect()
    }
}

fn run_one(entry: CleanupCallback) -> Result<(), CleanupFailure> {
    let CleanupCallback { callback, name } = entry;
    debug!(cleanup = %name, "Running cleanup");
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => {
            warn!(cleanup = %name, error = %message, "Cleanup failed");
            Err(CleanupFailure::new(name, message))
        }
        Err(panic) => {
            let message = format!("Cleanup callback panicked: {panic:?}");
            warn!(cleanup = %name, "{}", message);
            Err(CleanupFailure::new(name, message))
        }
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.pending_names())
            .finish()
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        if self.pending_count() > 0 {
            for failure in self.run_all() {
                warn!(cleanup = %failure.name, "Cleanup failed during drop: {}", failure.message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_registry_creation() {
        let registry = CleanupRegistry::new();
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_registry_lifo_order() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=3 {
            let order = order.clone();
            registry.register(&format!("cleanup-{i}"), move || {
                order.lock().push(i);
                Ok(())
            });
        }

        assert!(registry.run_all().is_empty());
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_registry_continues_on_failure() {
        let registry = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter1 = counter.clone();
        registry.register("first", move || {
            counter1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.register("fails", || Err("disk on fire".to_string()));
        registry.register("panics", || panic!("Intentional"));
        let counter2 = counter.clone();
        registry.register("last", move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failures = registry.run_all();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].name, "panics");
        assert_eq!(failures[1], CleanupFailure::new("fails", "disk on fire"));
    }

    #[test]
    fn test_actions_run_once() {
        let registry = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        registry.register("once", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.run_all();
        registry.run_all();
        drop(registry);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_runs_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let registry = CleanupRegistry::new();
            let c = counter.clone();
            registry.register("on-drop", move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_and_run_named() {
        let registry = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register("keep", || Ok(()));
        registry.register("remove", || Ok(()));
        let c = counter.clone();
        registry.register("now", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(registry.unregister_by_name("remove"));
        assert!(!registry.unregister_by_name("nonexistent"));
        assert_eq!(registry.run_named("now"), Ok(true));
        assert_eq!(registry.run_named("now"), Ok(false));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_names(), vec!["keep".to_string()]);
    }
}
