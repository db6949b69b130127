use crate::client::{BoxFuture, DatabaseClient};
use crate::error::{DbError, Operation};
use crate::udbc::driver::Driver;
use crate::udbc::query::{QueryDescriptor, QueryResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(feature = "postgres")]
use crate::models::db_config::PoolOptions;
#[cfg(feature = "postgres")]
use crate::udbc_postgres::pool::PgDriver;

/// Owns a connection pool and runs queries and transactions on short-lived
/// leases from it.
///
/// Every operation checks out its own [`DatabaseClient`] and releases it on
/// every exit path, errors included.
pub struct DatabaseManager {
    driver: Arc<dyn Driver>,
}

impl DatabaseManager {
    /// Builds a PostgreSQL pool from `options`.
    ///
    /// Unset options are stripped before the pool sees them so the driver's own
    /// defaults apply. Must be called inside a tokio runtime for idle
    /// connection reaping to run.
    #[cfg(feature = "postgres")]
    pub fn new(options: PoolOptions) -> Result<Self, DbError> {
        options.validate()?;
        let config = options.to_config_map()?;
        let driver = PgDriver::from_config(&config, options.callbacks.clone())?;
        Self::with_driver(Arc::new(driver))
    }

    pub fn with_driver(driver: Arc<dyn Driver>) -> Result<Self, DbError> {
        if driver.is_closed() {
            return Err(DbError::InvalidPool(format!(
                "pool '{}' is closed",
                driver.name()
            )));
        }
        info!(pool = driver.name(), kind = driver.r#type(), "database pool created");
        Ok(Self { driver })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Checks out a connected client. The caller owns the lease and must
    /// [`release`](DatabaseClient::release) it.
    pub async fn acquire(&self) -> Result<DatabaseClient, DbError> {
        if self.driver.is_closed() {
            return Err(DbError::PoolClosed);
        }
        let client = DatabaseClient::new(self.driver.clone())?;
        client.connect().await?;
        Ok(client)
    }

    pub async fn raw_query<T>(&self, text: &str, values: &T) -> Result<QueryResult, DbError>
    where
        T: Serialize + ?Sized,
    {
        let query = QueryDescriptor::raw(text, values)?;
        let client = self.acquire().await?;
        let result = client.execute(Operation::RawQuery, &query).await;
        self.finish(client, result).await
    }

    pub async fn query(&self, query: impl Into<QueryDescriptor>) -> Result<QueryResult, DbError> {
        let query = query.into();
        let client = self.acquire().await?;
        let result = client.execute(Operation::Query, &query).await;
        self.finish(client, result).await
    }

    /// Runs `work` in a transaction on one leased connection.
    ///
    /// `work` gets the leased client, not the manager, so its statements share
    /// the transaction. See [`DatabaseClient::run_transaction`].
    pub async fn run_transaction<T, F>(&self, work: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c DatabaseClient) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let client = self.acquire().await?;
        let result = client.run_transaction(work).await;
        self.finish(client, result).await
    }

    /// Alias of [`run_transaction`](Self::run_transaction).
    pub async fn run_tx<T, F>(&self, work: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c DatabaseClient) -> BoxFuture<'c, Result<T, DbError>>,
    {
        self.run_transaction(work).await
    }

    /// Releases `client` and picks the error to report: the operation's own
    /// error always wins over a release failure.
    async fn finish<T>(
        &self,
        client: DatabaseClient,
        result: Result<T, DbError>,
    ) -> Result<T, DbError> {
        let released = client.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(error = %err, release_error = %release_err, "release failed after error");
                Err(err)
            }
        }
    }

    /// Ends the pool. Waiting and later checkouts fail with [`DbError::PoolClosed`].
    pub async fn close(&self) -> Result<(), DbError> {
        info!(pool = self.driver.name(), "closing database pool");
        self.driver.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_closed()
    }
}
