use crate::error::DbError;
use crate::udbc::connection::Connection;
use async_trait::async_trait;
use std::sync::Arc;

/// The pool that physical connections are checked out from.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn r#type(&self) -> &str;

    /// Checks a connection out of the pool, waiting for capacity if needed.
    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError>;

    /// Ends the pool. Pending and later checkouts fail with [`DbError::PoolClosed`].
    async fn close(&self) -> Result<(), DbError>;

    fn is_closed(&self) -> bool;
}
