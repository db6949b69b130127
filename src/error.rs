use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// SQLSTATE reported for a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Which client operation produced a query error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    RawQuery,
    Query,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::RawQuery => f.write_str("raw query"),
            Operation::Query => f.write_str("query"),
        }
    }
}

/// Transaction control statement that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Begin,
    Commit,
    Rollback,
}

impl TxStage {
    pub fn sql(&self) -> &'static str {
        match self {
            TxStage::Begin => "BEGIN",
            TxStage::Commit => "COMMIT",
            TxStage::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// An error reported by the database driver for a single statement.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    /// SQLSTATE, when the server produced one.
    pub code: Option<String>,
    pub constraint: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            constraint: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The violated constraint when this is a unique violation, `"unknown"` if the
    /// server did not name it.
    pub fn unique_violation(&self) -> Option<&str> {
        if self.code.as_deref() != Some(UNIQUE_VIOLATION) {
            return None;
        }
        Some(self.constraint.as_deref().unwrap_or("unknown"))
    }

    pub fn is_transient(&self) -> bool {
        match self.code.as_deref() {
            Some(code) => {
                code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01")
            }
            // no SQLSTATE means the failure happened below the protocol level
            None => true,
        }
    }
}

/// Errors produced by the manager, the client wrapper and the drivers behind them.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid pool: {0}")]
    InvalidPool(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timed out waiting for a pooled connection")]
    Timeout,
    #[error("Pool is closed")]
    PoolClosed,
    #[error("Connect failed: {0}")]
    Connect(Arc<DbError>),
    #[error("Client is not connected")]
    NotConnected,
    #[error("Client has already been released")]
    Released,
    #[error("{op} failed{}: {source}", tx_suffix(.in_transaction))]
    Query {
        op: Operation,
        in_transaction: bool,
        #[source]
        source: DriverError,
    },
    #[error("{stage} failed: {source}")]
    Transaction {
        stage: TxStage,
        #[source]
        source: DriverError,
    },
    #[error("{error} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        error: Box<DbError>,
        rollback: Box<DbError>,
    },
    #[error("A transaction is already open on this client")]
    NestedTransaction,
    #[error("Release failed: {0}")]
    Release(#[source] Box<DbError>),
    #[error("Value error: {0}")]
    Value(String),
    #[error("General error: {0}")]
    General(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// The driver error underneath any context this error was wrapped in.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbError::Query { source, .. } | DbError::Transaction { source, .. } => Some(source),
            DbError::RollbackFailed { error, .. } => error.driver_error(),
            DbError::Release(inner) => inner.driver_error(),
            DbError::Connect(inner) => inner.driver_error(),
            _ => None,
        }
    }

    /// Constraint name for a unique violation, see [`DriverError::unique_violation`].
    pub fn unique_violation(&self) -> Option<&str> {
        self.driver_error().and_then(DriverError::unique_violation)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.unique_violation().is_some()
    }

    /// Whether retrying the same work on a fresh connection could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Connection(_) | DbError::Timeout => true,
            DbError::Connect(inner) => inner.is_transient(),
            DbError::RollbackFailed { error, .. } => error.is_transient(),
            _ => self.driver_error().is_some_and(DriverError::is_transient),
        }
    }

    pub fn is_pool_closed(&self) -> bool {
        match self {
            DbError::PoolClosed => true,
            DbError::Connect(inner) => inner.is_pool_closed(),
            _ => false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        match self {
            DbError::Query { in_transaction, .. } => *in_transaction,
            DbError::Transaction { .. }
            | DbError::RollbackFailed { .. }
            | DbError::NestedTransaction => true,
            _ => false,
        }
    }
}

fn tx_suffix(in_transaction: &bool) -> &'static str {
    if *in_transaction { " inside transaction" } else { "" }
}

impl serde::de::Error for DbError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        DbError::Configuration(msg.to_string())
    }
}
