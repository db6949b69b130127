use crate::error::{DbError, Operation, TxStage};
use crate::udbc::connection::Connection;
use crate::udbc::driver::Driver;
use crate::udbc::query::{QueryDescriptor, QueryResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

enum State {
    Unconnected,
    /// Waiters hold a receiver; the connecting caller drops the sender once the
    /// checkout settles, which wakes all of them.
    Connecting(watch::Receiver<()>),
    Connected(Arc<dyn Connection>),
    Failed(Arc<DbError>),
    Released,
}

enum Step {
    Done(Result<(), DbError>),
    Wait(watch::Receiver<()>),
    Acquire(watch::Sender<()>),
}

/// A single leased connection with query and transaction helpers on top.
///
/// The physical connection is checked out lazily on first use (or explicit
/// [`connect`](Self::connect)) and handed back by [`release`](Self::release).
/// Callers must not run two queries through the same client concurrently.
pub struct DatabaseClient {
    driver: Arc<dyn Driver>,
    state: Mutex<State>,
    in_transaction: AtomicBool,
    /// Set when a transaction future was dropped before COMMIT/ROLLBACK ran.
    rollback_pending: AtomicBool,
}

impl DatabaseClient {
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self, DbError> {
        if driver.is_closed() {
            return Err(DbError::InvalidPool(format!(
                "pool '{}' is closed",
                driver.name()
            )));
        }
        Ok(Self {
            driver,
            state: Mutex::new(State::Unconnected),
            in_transaction: AtomicBool::new(false),
            rollback_pending: AtomicBool::new(false),
        })
    }

    /// Checks a connection out of the pool, at most once per client.
    ///
    /// Concurrent callers wait for the first caller's checkout instead of making
    /// their own. If that checkout fails every caller gets the same error and the
    /// client stays failed.
    pub async fn connect(&self) -> Result<(), DbError> {
        loop {
            let step = {
                let mut state = self.state.lock();
                match &*state {
                    State::Connected(_) => Step::Done(Ok(())),
                    State::Failed(err) => Step::Done(Err(DbError::Connect(err.clone()))),
                    State::Released => Step::Done(Err(DbError::Released)),
                    State::Connecting(rx) => Step::Wait(rx.clone()),
                    State::Unconnected => {
                        let (tx, rx) = watch::channel(());
                        *state = State::Connecting(rx);
                        Step::Acquire(tx)
                    }
                }
            };

            match step {
                Step::Done(result) => return result,
                Step::Acquire(tx) => return self.acquire(tx).await,
                Step::Wait(mut rx) => {
                    // the sender is only ever dropped, so this returns Err once settled
                    let _ = rx.changed().await;
                }
            }
        }
    }

    async fn acquire(&self, notify: watch::Sender<()>) -> Result<(), DbError> {
        let _pending = PendingConnect {
            state: &self.state,
            _notify: notify,
        };
        let start = Instant::now();
        match self.driver.connect().await {
            Ok(conn) => {
                let released = {
                    let mut state = self.state.lock();
                    if matches!(*state, State::Released) {
                        true
                    } else {
                        *state = State::Connected(conn.clone());
                        false
                    }
                };
                if released {
                    debug!(connection = conn.id(), "client released during connect, returning connection");
                    conn.release().await.map_err(|e| DbError::Release(Box::new(e)))?;
                    return Err(DbError::Released);
                }
                debug!(
                    pool = self.driver.name(),
                    connection = conn.id(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "connection acquired"
                );
                Ok(())
            }
            Err(err) => {
                warn!(pool = self.driver.name(), error = %err, "connection checkout failed");
                let err = Arc::new(err);
                let mut state = self.state.lock();
                if matches!(*state, State::Connecting(_)) {
                    *state = State::Failed(err.clone());
                }
                Err(DbError::Connect(err))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), State::Connected(_))
    }

    /// Id of the leased physical connection, once connected.
    pub fn connection_id(&self) -> Option<u64> {
        match &*self.state.lock() {
            State::Connected(conn) => Some(conn.id()),
            _ => None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>, DbError> {
        self.connect().await?;
        let conn = match &*self.state.lock() {
            State::Connected(conn) => conn.clone(),
            State::Released => return Err(DbError::Released),
            _ => return Err(DbError::NotConnected),
        };
        if self.rollback_pending.swap(false, Ordering::SeqCst) {
            rollback_quietly(&conn).await;
        }
        Ok(conn)
    }

    /// Runs `text` with positional `values`, anything that serializes to a
    /// sequence: a tuple, a `Vec`, or `()` for none.
    pub async fn raw_query<T>(&self, text: &str, values: &T) -> Result<QueryResult, DbError>
    where
        T: Serialize + ?Sized,
    {
        let query = QueryDescriptor::raw(text, values)?;
        self.execute(Operation::RawQuery, &query).await
    }

    pub async fn query(&self, query: impl Into<QueryDescriptor>) -> Result<QueryResult, DbError> {
        let query = query.into();
        self.execute(Operation::Query, &query).await
    }

    pub(crate) async fn execute(
        &self,
        op: Operation,
        query: &QueryDescriptor,
    ) -> Result<QueryResult, DbError> {
        let conn = self.connection().await?;
        let in_transaction = self.in_transaction();
        let start = Instant::now();
        let result = conn.query(query).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(r) => debug!(
                sql = %query.text,
                params = query.values.len(),
                name = ?query.name,
                connection = conn.id(),
                in_transaction,
                elapsed_ms,
                rows = r.row_count,
                "query executed"
            ),
            Err(e) => debug!(
                sql = %query.text,
                params = query.values.len(),
                connection = conn.id(),
                in_transaction,
                elapsed_ms,
                error = %e,
                "query failed"
            ),
        }
        result.map_err(|source| DbError::Query {
            op,
            in_transaction,
            source,
        })
    }

    async fn control(&self, conn: &Arc<dyn Connection>, stage: TxStage) -> Result<(), DbError> {
        debug!(connection = conn.id(), "{}", stage);
        conn.query(&QueryDescriptor::new(stage.sql()))
            .await
            .map(|_| ())
            .map_err(|source| DbError::Transaction { stage, source })
    }

    /// Runs `work` inside BEGIN/COMMIT on this client's connection.
    ///
    /// `work` receives this client, so every statement it issues shares the
    /// transaction. Any error from BEGIN, `work` or COMMIT triggers a ROLLBACK
    /// and is returned as is. When the ROLLBACK fails too the result is
    /// [`DbError::RollbackFailed`], carrying the original error first.
    ///
    /// ```rust,ignore
    /// client.run_transaction(|c| Box::pin(async move {
    ///     c.raw_query("INSERT INTO t (id) VALUES ($1)", &(1,)).await?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn run_transaction<T, F>(&self, work: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c DatabaseClient) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let conn = self.connection().await?;
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbError::NestedTransaction);
        }
        let mut guard = TransactionGuard {
            client: self,
            settled: false,
        };

        let outcome = match self.control(&conn, TxStage::Begin).await {
            Ok(()) => match work(self).await {
                Ok(value) => self.control(&conn, TxStage::Commit).await.map(|()| value),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(value) => Ok(value),
            Err(err) => match self.control(&conn, TxStage::Rollback).await {
                Ok(()) => Err(err),
                Err(rollback) => {
                    warn!(error = %err, rollback_error = %rollback, "rollback failed");
                    Err(DbError::RollbackFailed {
                        error: Box::new(err),
                        rollback: Box::new(rollback),
                    })
                }
            },
        };
        guard.settled = true;
        result
    }

    /// Alias of [`run_transaction`](Self::run_transaction).
    pub async fn run_tx<T, F>(&self, work: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c DatabaseClient) -> BoxFuture<'c, Result<T, DbError>>,
    {
        self.run_transaction(work).await
    }

    /// Returns the connection to the pool.
    ///
    /// Succeeds without doing anything if no connection was ever checked out.
    /// Every later operation, including another release, fails with
    /// [`DbError::Released`].
    pub async fn release(&self) -> Result<(), DbError> {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Released);
        match previous {
            State::Connected(conn) => {
                if self.rollback_pending.swap(false, Ordering::SeqCst) {
                    rollback_quietly(&conn).await;
                }
                debug!(connection = conn.id(), "releasing connection");
                conn.release().await.map_err(|e| DbError::Release(Box::new(e)))
            }
            State::Released => Err(DbError::Released),
            State::Unconnected | State::Connecting(_) | State::Failed(_) => Ok(()),
        }
    }
}

impl Drop for DatabaseClient {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), State::Released);
        let State::Connected(conn) = state else {
            return;
        };
        let rollback = *self.rollback_pending.get_mut();
        warn!(connection = conn.id(), "client dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if rollback {
                        rollback_quietly(&conn).await;
                    }
                    if let Err(e) = conn.release().await {
                        warn!(connection = conn.id(), error = %e, "background release failed");
                    }
                });
            }
            Err(_) => warn!(connection = conn.id(), "no runtime to release connection on"),
        }
    }
}

async fn rollback_quietly(conn: &Arc<dyn Connection>) {
    if let Err(e) = conn.query(&QueryDescriptor::new(TxStage::Rollback.sql())).await {
        warn!(connection = conn.id(), error = %e, "deferred rollback failed");
    }
}

/// Marks the client failed if the connecting future is dropped mid-checkout,
/// then wakes the waiters by dropping the sender.
struct PendingConnect<'a> {
    state: &'a Mutex<State>,
    _notify: watch::Sender<()>,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if matches!(*state, State::Connecting(_)) {
            *state = State::Failed(Arc::new(DbError::General("connect was cancelled".into())));
        }
    }
}

struct TransactionGuard<'a> {
    client: &'a DatabaseClient,
    settled: bool,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("transaction dropped before it settled, rolling back on next use");
            self.client.rollback_pending.store(true, Ordering::SeqCst);
        }
        self.client.in_transaction.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        checkouts: AtomicUsize,
        releases: AtomicUsize,
    }

    struct StubConnection(Arc<Counters>);

    #[async_trait]
    impl Connection for StubConnection {
        fn id(&self) -> u64 {
            1
        }

        async fn query(&self, query: &QueryDescriptor) -> Result<QueryResult, DriverError> {
            Ok(QueryResult {
                command: crate::udbc::query::command_of(&query.text),
                ..Default::default()
            })
        }

        async fn release(&self) -> Result<(), DbError> {
            self.0.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubDriver {
        counters: Arc<Counters>,
        closed: bool,
    }

    #[async_trait]
    impl Driver for StubDriver {
        fn name(&self) -> &str {
            "stub"
        }

        fn r#type(&self) -> &str {
            "stub"
        }

        async fn connect(&self) -> Result<Arc<dyn Connection>, DbError> {
            self.counters.checkouts.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(StubConnection(self.counters.clone())))
        }

        async fn close(&self) -> Result<(), DbError> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn client() -> (DatabaseClient, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let driver = StubDriver {
            counters: counters.clone(),
            closed: false,
        };
        (DatabaseClient::new(Arc::new(driver)).unwrap(), counters)
    }

    #[test]
    fn test_closed_pool_is_invalid() {
        let driver = StubDriver {
            counters: Arc::default(),
            closed: true,
        };
        assert!(matches!(
            DatabaseClient::new(Arc::new(driver)),
            Err(DbError::InvalidPool(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (client, counters) = client();
        for _ in 0..5 {
            client.connect().await.unwrap();
        }
        assert!(client.is_connected());
        assert_eq!(client.connection_id(), Some(1));
        assert_eq!(counters.checkouts.load(Ordering::SeqCst), 1);
        client.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_connect_checks_out_once() {
        let (client, counters) = client();
        let (a, b, c) = tokio::join!(client.connect(), client.connect(), client.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(counters.checkouts.load(Ordering::SeqCst), 1);
        client.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_before_connect_is_a_noop() {
        let (client, counters) = client();
        client.release().await.unwrap();
        assert_eq!(counters.checkouts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_released_client_fails_loudly() {
        let (client, counters) = client();
        client.connect().await.unwrap();
        client.release().await.unwrap();
        assert!(matches!(client.release().await, Err(DbError::Released)));
        assert!(matches!(client.query("SELECT 1").await, Err(DbError::Released)));
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_connects_lazily() {
        let (client, counters) = client();
        let result = client.raw_query("select $1", &(1,)).await.unwrap();
        assert_eq!(result.command, "SELECT");
        assert_eq!(counters.checkouts.load(Ordering::SeqCst), 1);
        client.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_transaction_is_rejected() {
        let (client, _) = client();
        let err = client
            .run_transaction(|c| {
                Box::pin(async move {
                    c.run_transaction(|_| Box::pin(async move { Ok(()) })).await
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NestedTransaction));
        assert!(!client.in_transaction());
        client.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_client_releases_in_background() {
        let (client, counters) = client();
        client.connect().await.unwrap();
        drop(client);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }
}
