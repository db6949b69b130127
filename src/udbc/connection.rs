use crate::error::{DbError, DriverError};
use crate::udbc::query::{QueryDescriptor, QueryResult};
use async_trait::async_trait;

/// A physical connection leased from a [`Driver`](crate::udbc::driver::Driver).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Pool-assigned identifier, stable for the life of the physical connection.
    fn id(&self) -> u64;

    async fn query(&self, query: &QueryDescriptor) -> Result<QueryResult, DriverError>;

    /// Hands the connection back to its pool. Called at most once by the client.
    async fn release(&self) -> Result<(), DbError>;
}
