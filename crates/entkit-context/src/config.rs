//! Persistence context configuration.

/// Configuration for [`PersistenceContext`](crate::PersistenceContext)
/// behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Flush pending changes before any query runs, so queries observe them.
    pub auto_flush: bool,
    /// Detach every managed instance after a bulk update or delete, since
    /// their in-memory state may no longer match the rows.
    pub clear_after_bulk: bool,
    /// Detach every managed instance when a transaction rolls back.
    pub detach_on_rollback: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            clear_after_bulk: false,
            detach_on_rollback: true,
        }
    }
}

impl ContextConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `auto_flush` option (builder pattern).
    #[must_use]
    pub fn with_auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    /// Set the `clear_after_bulk` option (builder pattern).
    #[must_use]
    pub fn with_clear_after_bulk(mut self, value: bool) -> Self {
        self.clear_after_bulk = value;
        self
    }

    /// Set the `detach_on_rollback` option (builder pattern).
    #[must_use]
    pub fn with_detach_on_rollback(mut self, value: bool) -> Self {
        self.detach_on_rollback = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert!(config.auto_flush);
        assert!(!config.clear_after_bulk);
        assert!(config.detach_on_rollback);
    }

    #[test]
    fn test_builder() {
        let config = ContextConfig::new()
            .with_auto_flush(false)
            .with_clear_after_bulk(true);
        assert!(!config.auto_flush);
        assert!(config.clear_after_bulk);
    }
}
