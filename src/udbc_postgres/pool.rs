use crate::error::DbError;
use crate::models::db_config::{ConnectionInfo, PoolCallbacks};
use crate::udbc::connection::Connection;
use crate::udbc::deserializer::MapDeserializer;
use crate::udbc::driver::Driver;
use crate::udbc::value::Value;
use crate::udbc::DEFAULT_DB_NAME;
use crate::udbc_postgres::connection::PgConnection;
use async_trait::async_trait;
use deadpool::managed::{self, Metrics, PoolError, RecycleError, RecycleResult};
use parking_lot::Mutex;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, info, warn};

const POSTGRES_TYPE: &str = "postgres";
const APPLICATION_NAME: &str = "dbmanager";

fn default_idle_timeout() -> u64 {
    10_000
}

fn default_max() -> usize {
    10
}

/// Driver configuration, decoded from the null-stripped option map.
#[derive(Debug, Clone, Deserialize)]
pub struct PgPoolConfig {
    pub connection_string: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub database: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub connection_timeout_millis: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_millis: u64,
    #[serde(default = "default_max")]
    pub max: usize,
    #[serde(default)]
    pub allow_exit_on_idle: bool,
}

impl PgPoolConfig {
    pub fn from_map(map: &HashMap<String, Value>) -> Result<Self, DbError> {
        Self::deserialize(MapDeserializer::new(map))
    }

    /// Connection settings: whatever the connection string names wins, explicit
    /// fields fill what it leaves out, then the PG* environment.
    pub fn pg_config(&self) -> Result<Config, DbError> {
        let mut config = match &self.connection_string {
            Some(url) => {
                // the URL parser fills in 5432 for hosts without a port
                let url = self
                    .port
                    .and_then(|port| url_with_port(url, port))
                    .unwrap_or_else(|| url.clone());
                url.parse::<Config>().map_err(|e| {
                    DbError::Configuration(format!("invalid connection string: {}", e))
                })?
            }
            None => Config::new(),
        };
        if config.get_user().is_none() {
            if let Some(user) = &self.user {
                config.user(user.as_str());
            }
        }
        if config.get_password().is_none() {
            if let Some(password) = &self.password {
                config.password(password.as_str());
            }
        }
        if config.get_dbname().is_none() {
            if let Some(database) = &self.database {
                config.dbname(database.as_str());
            }
        }
        // hosts and ports accumulate, so only add them when the string had none
        if config.get_hosts().is_empty() {
            if let Some(host) = &self.host {
                config.host(host.as_str());
            }
        }
        if config.get_ports().is_empty() {
            if let Some(port) = self.port {
                config.port(port);
            }
        }

        if config.get_user().is_none() {
            if let Some(user) = env("PGUSER").or_else(|| env("USER")) {
                config.user(user.as_str());
            }
        }
        if config.get_password().is_none() {
            if let Some(password) = env("PGPASSWORD") {
                config.password(password.as_str());
            }
        }
        if config.get_dbname().is_none() {
            if let Some(database) = env("PGDATABASE") {
                config.dbname(database.as_str());
            }
        }
        if config.get_hosts().is_empty() {
            let host = env("PGHOST").unwrap_or_else(|| "localhost".to_string());
            config.host(host.as_str());
        }
        if config.get_ports().is_empty() {
            let port = match env("PGPORT") {
                Some(port) => port
                    .parse()
                    .map_err(|_| DbError::Configuration(format!("invalid PGPORT '{}'", port)))?,
                None => 5432,
            };
            config.port(port);
        }

        if config.get_application_name().is_none() {
            config.application_name(APPLICATION_NAME);
        }
        if self.connection_timeout_millis > 0 {
            config.connect_timeout(Duration::from_millis(self.connection_timeout_millis));
        }
        if self.ssl && config.get_ssl_mode() != SslMode::Require {
            config.ssl_mode(SslMode::Require);
        }
        Ok(config)
    }

    fn timeout(&self) -> Option<Duration> {
        (self.connection_timeout_millis > 0)
            .then(|| Duration::from_millis(self.connection_timeout_millis))
    }
}

/// Rewrites a `postgres://` URL so every host without a port gets `port`.
/// Returns `None` for key=value strings and URLs without hosts.
fn url_with_port(url: &str, port: u16) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme != "postgres" && scheme != "postgresql" {
        return None;
    }
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(end);
    let (userinfo, hosts) = match authority.rfind('@') {
        Some(at) => authority.split_at(at + 1),
        None => ("", authority),
    };
    if hosts.is_empty() {
        return None;
    }
    let hosts = hosts
        .split(',')
        .map(|host| {
            if host.is_empty() || has_port(host) {
                host.to_string()
            } else {
                format!("{}:{}", host, port)
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("{}://{}{}{}", scheme, userinfo, hosts, tail))
}

// `[::1]:5432` keeps its port after the bracket
fn has_port(host: &str) -> bool {
    let host = host.rfind(']').map_or(host, |i| &host[i + 1..]);
    host.contains(':')
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn tls_connector(config: &Config) -> Result<Option<MakeTlsConnector>, DbError> {
    if config.get_ssl_mode() != SslMode::Require {
        return Ok(None);
    }
    let connector = TlsConnector::builder()
        .build()
        .map_err(|e| DbError::Configuration(format!("failed to build TLS connector: {}", e)))?;
    Ok(Some(MakeTlsConnector::new(connector)))
}

/// A physical connection as the pool holds it.
pub struct PgClient {
    pub info: ConnectionInfo,
    pub client: Client,
}

pub struct PgManager {
    config: Config,
    tls: Option<MakeTlsConnector>,
    callbacks: PoolCallbacks,
    next_id: AtomicU64,
}

impl managed::Manager for PgManager {
    type Type = PgClient;
    type Error = DbError;

    async fn create(&self) -> Result<PgClient, DbError> {
        let info = ConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        let callbacks = self.callbacks.clone();
        let client = match &self.tls {
            Some(tls) => {
                let (client, connection) = self
                    .config
                    .connect(tls.clone())
                    .await
                    .map_err(|e| DbError::Connection(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(connection = info.id, error = %e, "connection error");
                        callbacks.errored(&DbError::Connection(e.to_string()), Some(&info));
                    }
                });
                client
            }
            None => {
                let (client, connection) = self
                    .config
                    .connect(NoTls)
                    .await
                    .map_err(|e| DbError::Connection(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(connection = info.id, error = %e, "connection error");
                        callbacks.errored(&DbError::Connection(e.to_string()), Some(&info));
                    }
                });
                client
            }
        };
        debug!(connection = info.id, "connection established");
        self.callbacks.connected(&info);
        Ok(PgClient { info, client })
    }

    async fn recycle(&self, obj: &mut PgClient, _: &Metrics) -> RecycleResult<DbError> {
        if obj.client.is_closed() {
            debug!(connection = obj.info.id, "dropping closed connection");
            self.callbacks.removed(&obj.info);
            return Err(RecycleError::Message("connection closed".into()));
        }
        Ok(())
    }
}

pub type PgPool = managed::Pool<PgManager>;

/// PostgreSQL [`Driver`] over a `deadpool` managed pool.
pub struct PgDriver {
    name: String,
    pool: PgPool,
    callbacks: PoolCallbacks,
    idle_timeout: Option<Duration>,
    allow_exit_on_idle: bool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PgDriver {
    /// Builds the pool from a null-stripped option map. Nothing connects until
    /// the first checkout.
    pub fn from_config(
        config: &HashMap<String, Value>,
        callbacks: PoolCallbacks,
    ) -> Result<Self, DbError> {
        let config = PgPoolConfig::from_map(config)?;
        Self::new(config, callbacks)
    }

    pub fn new(config: PgPoolConfig, callbacks: PoolCallbacks) -> Result<Self, DbError> {
        if config.max == 0 {
            return Err(DbError::Configuration("max must be at least 1".into()));
        }
        let pg_config = config.pg_config()?;
        let tls = tls_connector(&pg_config)?;
        let manager = PgManager {
            config: pg_config,
            tls,
            callbacks: callbacks.clone(),
            next_id: AtomicU64::new(1),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(config.max)
            .wait_timeout(config.timeout())
            .create_timeout(config.timeout())
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| DbError::Configuration(e.to_string()))?;
        info!(max = config.max, ssl = config.ssl, "postgres pool configured");
        Ok(Self {
            name: DEFAULT_DB_NAME.to_string(),
            pool,
            callbacks,
            idle_timeout: (config.idle_timeout_millis > 0)
                .then(|| Duration::from_millis(config.idle_timeout_millis)),
            allow_exit_on_idle: config.allow_exit_on_idle,
            reaper: Mutex::new(None),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn reaper_running(&self) -> bool {
        self.reaper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts the idle reaper unless one is already running. Called on every
    /// checkout, so a reaper that exited on an empty pool comes back with the
    /// next connection.
    fn start_reaper(&self) {
        let Some(idle) = self.idle_timeout else {
            return;
        };
        let mut reaper = self.reaper.lock();
        if reaper.as_ref().is_some_and(|handle| !handle.is_finished()) || self.pool.is_closed() {
            return;
        }
        *reaper = Some(tokio::spawn(reap_idle(
            self.pool.clone(),
            idle,
            IdleReaper::new(self.allow_exit_on_idle),
            self.callbacks.clone(),
        )));
    }

    fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

/// Exit decision of the idle reaper.
struct IdleReaper {
    allow_exit_on_idle: bool,
    held_connections: bool,
}

impl IdleReaper {
    fn new(allow_exit_on_idle: bool) -> Self {
        Self {
            allow_exit_on_idle,
            held_connections: false,
        }
    }

    /// Whether to stop after a sweep that left `size` connections. Only a pool
    /// that drained counts as idle, not one that has not connected yet.
    fn should_exit(&mut self, size: usize) -> bool {
        if size > 0 {
            self.held_connections = true;
            return false;
        }
        self.allow_exit_on_idle && self.held_connections
    }
}

async fn reap_idle(pool: PgPool, idle: Duration, mut state: IdleReaper, callbacks: PoolCallbacks) {
    let period = (idle / 2).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if pool.is_closed() {
            break;
        }
        let result = pool.retain(|_, metrics| metrics.last_used() < idle);
        for client in &result.removed {
            debug!(connection = client.info.id, "closing idle connection");
            callbacks.removed(&client.info);
        }
        if state.should_exit(pool.status().size) {
            debug!("pool drained, idle reaper exiting");
            break;
        }
    }
}

fn pool_error(err: PoolError<DbError>) -> DbError {
    match err {
        PoolError::Closed => DbError::PoolClosed,
        PoolError::Timeout(_) => DbError::Timeout,
        PoolError::Backend(e) => e,
        other => DbError::Connection(other.to_string()),
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn r#type(&self) -> &str {
        POSTGRES_TYPE
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError> {
        let object = self.pool.get().await.map_err(|e| {
            let err = pool_error(e);
            if !matches!(err, DbError::PoolClosed) {
                self.callbacks.errored(&err, None);
            }
            err
        })?;
        self.start_reaper();
        self.callbacks.acquired(&object.info);
        Ok(Arc::new(PgConnection::new(object, self.callbacks.clone())))
    }

    async fn close(&self) -> Result<(), DbError> {
        self.pool.close();
        self.stop_reaper();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl Drop for PgDriver {
    fn drop(&mut self) {
        self.pool.close();
        self.stop_reaper();
    }
}
