//! Instance lifecycle states and the legal transitions between them.

use entkit_core::{Error, LifecycleError, Result};

/// Where an instance stands relative to a persistence context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Never persisted and unknown to the context
    Transient,
    /// Tracked; changes are written at flush
    Managed,
    /// Scheduled for deletion at the next flush
    Removed,
    /// Persisted once but no longer tracked
    Detached,
}

impl LifecycleState {
    pub const fn name(self) -> &'static str {
        match self {
            LifecycleState::Transient => "transient",
            LifecycleState::Managed => "managed",
            LifecycleState::Removed => "removed",
            LifecycleState::Detached => "detached",
        }
    }
}

/// A requested state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Persist,
    Remove,
    Detach,
}

impl LifecycleOp {
    pub const fn name(self) -> &'static str {
        match self {
            LifecycleOp::Persist => "persist",
            LifecycleOp::Remove => "remove",
            LifecycleOp::Detach => "detach",
        }
    }
}

/// The state an instance of `entity` moves to under `op`.
///
/// Persisting or removing a detached instance is an error. Removing a
/// transient instance and detaching one that was never managed are no-ops.
pub fn transition(
    state: LifecycleState,
    entity: &'static str,
    op: LifecycleOp,
) -> Result<LifecycleState> {
    use LifecycleOp as Op;
    use LifecycleState as S;

    match (state, op) {
        (S::Transient | S::Managed | S::Removed, Op::Persist) => Ok(S::Managed),
        (S::Transient, Op::Remove) => Ok(S::Transient),
        (S::Managed | S::Removed, Op::Remove) => Ok(S::Removed),
        (S::Managed | S::Removed | S::Detached, Op::Detach) => Ok(S::Detached),
        (S::Transient, Op::Detach) => Ok(S::Transient),
        (S::Detached, Op::Persist | Op::Remove) => Err(Error::Lifecycle(LifecycleError {
            entity,
            state: state.name(),
            operation: op.name(),
        })),
    }
}
