//! Error types for entkit operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all persistence and query operations.
///
/// None of these are retried or swallowed internally. After any error raised
/// from a flush the caller is expected to roll the transaction back, since a
/// partially applied write-set leaves the database state ambiguous.
#[derive(Debug)]
pub enum Error {
    /// Two different instances claim the same identity within one context
    IdentityConflict(IdentityConflictError),
    /// A write targeted a row whose persisted state no longer matches
    StaleState(StaleStateError),
    /// Cyclic mandatory foreign-key dependency among pending inserts
    UnresolvableInsertOrder(InsertOrderError),
    /// Operation on a closed context, or a proxy resolved after closure
    ContextClosed(ContextClosedError),
    /// Invalid query, rejected before any execution
    QueryCompilation(QueryCompilationError),
    /// Illegal lifecycle transition (e.g. persisting a detached instance)
    Lifecycle(LifecycleError),
    /// A lazy reference pointed at a row that does not exist
    NotFound(NotFoundError),
    /// `fetch_one` matched more than one row
    NonUniqueResult { count: usize },
    /// Value conversion errors
    Type(TypeError),
    /// Entity metadata or row decoding problems
    Mapping(MappingError),
    /// Failure reported by the executor capability
    Executor(ExecutorError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct IdentityConflictError {
    pub entity: &'static str,
    pub key: Value,
}

/// Which kind of write hit a stale row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Update,
    Delete,
}

#[derive(Debug)]
pub struct StaleStateError {
    pub entity: &'static str,
    pub key: Value,
    pub write: WriteKind,
    pub table: &'static str,
}

#[derive(Debug)]
pub struct InsertOrderError {
    /// Entities participating in the unbreakable cycle, in persist order
    pub entities: Vec<String>,
}

#[derive(Debug)]
pub struct ContextClosedError {
    pub operation: &'static str,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCompilationErrorKind {
    /// Alias used but never introduced by `from`/`join`
    UnknownAlias,
    /// Alias introduced twice
    DuplicateAlias,
    /// Field does not exist on the alias's entity
    UnknownField,
    /// Relationship does not exist on the alias's entity
    UnknownRelation,
    /// Join target or compared operand types do not match
    TypeMismatch,
    /// Aggregate mixed illegally with plain projections
    AggregatePlacement,
    /// Named parameter used without a binding
    UnboundParameter,
    /// Subquery shape is not usable in its position
    InvalidSubquery,
    /// Query is missing a required clause
    Incomplete,
}

#[derive(Debug)]
pub struct QueryCompilationError {
    pub kind: QueryCompilationErrorKind,
    pub message: String,
}

#[derive(Debug)]
pub struct LifecycleError {
    pub entity: &'static str,
    pub state: &'static str,
    pub operation: &'static str,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub entity: &'static str,
    pub key: Value,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ExecutorError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a compilation error.
    pub fn compile(kind: QueryCompilationErrorKind, message: impl Into<String>) -> Self {
        Error::QueryCompilation(QueryCompilationError {
            kind,
            message: message.into(),
        })
    }

    /// Build a mapping error for an entity.
    pub fn mapping(entity: &'static str, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity,
            message: message.into(),
        })
    }

    /// Build a closed-context error.
    pub fn closed(operation: &'static str) -> Self {
        Error::ContextClosed(ContextClosedError {
            operation,
            detail: None,
        })
    }

    /// Build an executor error from a message.
    pub fn executor(message: impl Into<String>) -> Self {
        Error::Executor(ExecutorError {
            message: message.into(),
            source: None,
        })
    }

    /// Whether the surrounding transaction must be rolled back.
    ///
    /// Compilation and lookup errors are raised before anything is written;
    /// everything else may leave a partially applied write-set behind.
    pub fn is_fatal_to_transaction(&self) -> bool {
        !matches!(
            self,
            Error::QueryCompilation(_) | Error::NotFound(_) | Error::NonUniqueResult { .. }
        )
    }

    /// The compilation error kind, if this is a compilation error.
    pub fn compilation_kind(&self) -> Option<QueryCompilationErrorKind> {
        match self {
            Error::QueryCompilation(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IdentityConflict(e) => write!(
                f,
                "Identity conflict: another {} instance is already managed for key {}",
                e.entity, e.key
            ),
            Error::StaleState(e) => write!(
                f,
                "Stale state: {:?} of {} {} in table '{}' affected no rows",
                e.write, e.entity, e.key, e.table
            ),
            Error::UnresolvableInsertOrder(e) => write!(
                f,
                "Unresolvable insert order: mandatory foreign keys form a cycle between {}",
                e.entities.join(", ")
            ),
            Error::ContextClosed(e) => match &e.detail {
                Some(detail) => write!(f, "Context closed during {}: {}", e.operation, detail),
                None => write!(f, "Context closed during {}", e.operation),
            },
            Error::QueryCompilation(e) => {
                write!(f, "Query compilation error ({:?}): {}", e.kind, e.message)
            }
            Error::Lifecycle(e) => write!(
                f,
                "Cannot {} a {} instance of {}",
                e.operation, e.state, e.entity
            ),
            Error::NotFound(e) => write!(f, "No {} row found for key {}", e.entity, e.key),
            Error::NonUniqueResult { count } => {
                write!(f, "Expected at most one result, found {}", count)
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error for {}: {}", e.entity, e.message),
            Error::Executor(e) => write!(f, "Executor error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Executor(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<QueryCompilationError> for Error {
    fn from(err: QueryCompilationError) -> Self {
        Error::QueryCompilation(err)
    }
}

impl From<ExecutorError> for Error {
    fn from(err: ExecutorError) -> Self {
        Error::Executor(err)
    }
}

/// Result type alias for entkit operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_errors_do_not_poison_transaction() {
        let err = Error::compile(QueryCompilationErrorKind::UnknownField, "m.nope");
        assert!(!err.is_fatal_to_transaction());
        assert_eq!(
            err.compilation_kind(),
            Some(QueryCompilationErrorKind::UnknownField)
        );

        let stale = Error::StaleState(StaleStateError {
            entity: "Member",
            key: Value::BigInt(1),
            write: WriteKind::Update,
            table: "member",
        });
        assert!(stale.is_fatal_to_transaction());
    }

    #[test]
    fn test_display_mentions_cycle_members() {
        let err = Error::UnresolvableInsertOrder(InsertOrderError {
            entities: vec!["Husband".into(), "Wife".into()],
        });
        let text = err.to_string();
        assert!(text.contains("Husband"));
        assert!(text.contains("Wife"));
    }

    #[test]
    fn test_closed_display_includes_detail() {
        let err = Error::ContextClosed(ContextClosedError {
            operation: "resolve",
            detail: Some("proxy for Team 1".into()),
        });
        assert_eq!(
            err.to_string(),
            "Context closed during resolve: proxy for Team 1"
        );
    }
}
