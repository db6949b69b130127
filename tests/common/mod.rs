#![allow(dead_code)]

use async_trait::async_trait;
use dbmanager::error::{DbError, DriverError};
use dbmanager::udbc::connection::Connection;
use dbmanager::udbc::driver::Driver;
use dbmanager::udbc::query::{Field, QueryDescriptor, QueryResult, Row, RowMode, command_of};
use dbmanager::udbc::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone)]
struct Failure {
    prefix: String,
    message: String,
    code: Option<String>,
    constraint: Option<String>,
}

/// In-memory pool that records what each connection was asked to run.
#[derive(Default)]
pub struct MockState {
    pub checkouts: AtomicUsize,
    pub releases: AtomicUsize,
    statements: Mutex<Vec<(u64, String)>>,
    failures: Mutex<Vec<Failure>>,
    connect_failure: Mutex<Option<String>>,
    connect_delay: Mutex<Option<Duration>>,
    release_failure: AtomicBool,
    closed: AtomicBool,
    closing: Notify,
    next_id: AtomicU64,
}

impl MockState {
    /// Statements run so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    /// Ids of the connections statements ran on, in order.
    pub fn connection_ids(&self) -> Vec<u64> {
        self.statements.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn failure_for(&self, text: &str) -> Option<Failure> {
        let upper = text.trim_start().to_ascii_uppercase();
        self.failures
            .lock()
            .iter()
            .find(|f| upper.starts_with(&f.prefix))
            .cloned()
    }
}

#[derive(Clone)]
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    /// Statements starting with `prefix` (case-insensitive) fail.
    pub fn fail_on(&self, prefix: &str, message: &str) -> &Self {
        self.push_failure(prefix, message, None, None)
    }

    pub fn fail_with_code(
        &self,
        prefix: &str,
        message: &str,
        code: &str,
        constraint: Option<&str>,
    ) -> &Self {
        self.push_failure(prefix, message, Some(code), constraint)
    }

    fn push_failure(
        &self,
        prefix: &str,
        message: &str,
        code: Option<&str>,
        constraint: Option<&str>,
    ) -> &Self {
        self.state.failures.lock().push(Failure {
            prefix: prefix.to_ascii_uppercase(),
            message: message.to_string(),
            code: code.map(str::to_string),
            constraint: constraint.map(str::to_string),
        });
        self
    }

    pub fn fail_connect(&self, message: &str) -> &Self {
        *self.state.connect_failure.lock() = Some(message.to_string());
        self
    }

    pub fn connect_delay(&self, delay: Duration) -> &Self {
        *self.state.connect_delay.lock() = Some(delay);
        self
    }

    pub fn fail_release(&self) -> &Self {
        self.state.release_failure.store(true, Ordering::SeqCst);
        self
    }

    pub fn shared(&self) -> Arc<dyn Driver> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn r#type(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError> {
        // registered before the check so a close in between still wakes us
        let closing = self.state.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }
        self.state.checkouts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.lock();
        let wait = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
        };
        tokio::select! {
            _ = wait => {}
            _ = &mut closing => return Err(DbError::PoolClosed),
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }
        let failure = self.state.connect_failure.lock().clone();
        if let Some(message) = failure {
            return Err(DbError::Connection(message));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockConnection {
            id,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), DbError> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.closing.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn query(&self, query: &QueryDescriptor) -> Result<QueryResult, DriverError> {
        self.state
            .statements
            .lock()
            .push((self.id, query.text.clone()));
        tokio::task::yield_now().await;
        if let Some(failure) = self.state.failure_for(&query.text) {
            let mut err = DriverError::new(failure.message);
            if let Some(code) = failure.code {
                err = err.with_code(code);
            }
            if let Some(constraint) = failure.constraint {
                err = err.with_constraint(constraint);
            }
            return Err(err);
        }
        // echo the parameters back as a single row
        let fields = (0..query.values.len())
            .map(|i| Field {
                name: format!("p{}", i + 1),
                type_oid: 0,
            })
            .collect::<Vec<_>>();
        let row = match query.effective_row_mode() {
            RowMode::Array => Row::Array(query.values.clone()),
            RowMode::Object => Row::Object(
                fields
                    .iter()
                    .zip(&query.values)
                    .map(|(f, v)| (f.name.clone(), v.clone()))
                    .collect::<HashMap<String, Value>>(),
            ),
        };
        let rows = if fields.is_empty() { Vec::new() } else { vec![row] };
        Ok(QueryResult {
            command: command_of(&query.text),
            row_count: rows.len() as u64,
            fields,
            rows,
        })
    }

    async fn release(&self) -> Result<(), DbError> {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        if self.state.release_failure.load(Ordering::SeqCst) {
            return Err(DbError::Connection("socket closed while returning".into()));
        }
        Ok(())
    }
}
