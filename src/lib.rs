pub mod client;
pub mod error;
pub mod helpers;
pub mod manager;
pub mod models;
pub mod udbc;
#[cfg(feature = "postgres")]
pub mod udbc_postgres;

pub use client::{BoxFuture, DatabaseClient};
pub use error::{DbError, DriverError};
pub use helpers::remove_nulls;
pub use manager::DatabaseManager;
pub use models::db_config::{ConnectionInfo, PoolCallbacks, PoolOptions};
pub use udbc::query::{QueryDescriptor, QueryResult, Row, RowMode};
pub use udbc::value::Value;
