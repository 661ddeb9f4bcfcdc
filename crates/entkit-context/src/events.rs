//! Context lifecycle callbacks.

use entkit_core::Error;

/// Callbacks take no arguments; returning `Err` aborts the operation that
/// fired them.
type ContextEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Context lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Before a flush writes anything.
    BeforeFlush,
    /// After a flush completed.
    AfterFlush,
    /// Before commit, after the final flush.
    BeforeCommit,
    /// After the executor committed.
    AfterCommit,
    /// After a rollback.
    AfterRollback,
}

/// Registered callbacks, per event.
#[derive(Default)]
pub struct ContextEventCallbacks {
    before_flush: Vec<ContextEventFn>,
    after_flush: Vec<ContextEventFn>,
    before_commit: Vec<ContextEventFn>,
    after_commit: Vec<ContextEventFn>,
    after_rollback: Vec<ContextEventFn>,
}

impl std::fmt::Debug for ContextEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl ContextEventCallbacks {
    fn slot(&mut self, event: ContextEvent) -> &mut Vec<ContextEventFn> {
        match event {
            ContextEvent::BeforeFlush => &mut self.before_flush,
            ContextEvent::AfterFlush => &mut self.after_flush,
            ContextEvent::BeforeCommit => &mut self.before_commit,
            ContextEvent::AfterCommit => &mut self.after_commit,
            ContextEvent::AfterRollback => &mut self.after_rollback,
        }
    }

    pub fn register(
        &mut self,
        event: ContextEvent,
        f: impl FnMut() -> Result<(), Error> + Send + 'static,
    ) {
        self.slot(event).push(Box::new(f));
    }

    /// Run every callback for `event`, stopping at the first error.
    pub fn fire(&mut self, event: ContextEvent) -> Result<(), Error> {
        let callbacks = self.slot(event);
        if !callbacks.is_empty() {
            tracing::trace!(event = ?event, count = callbacks.len(), "Firing context event");
        }
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_runs_only_matching_event() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut callbacks = ContextEventCallbacks::default();
        let seen = Arc::clone(&counter);
        callbacks.register(ContextEvent::AfterFlush, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        callbacks.fire(ContextEvent::BeforeFlush).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        callbacks.fire(ContextEvent::AfterFlush).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_stops_remaining_callbacks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut callbacks = ContextEventCallbacks::default();
        callbacks.register(ContextEvent::BeforeCommit, || {
            Err(Error::Custom("vetoed".into()))
        });
        let seen = Arc::clone(&counter);
        callbacks.register(ContextEvent::BeforeCommit, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(callbacks.fire(ContextEvent::BeforeCommit).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(format!("{:?}", callbacks).contains("before_commit: 2"));
    }
}
