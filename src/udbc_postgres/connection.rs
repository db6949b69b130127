use crate::error::{DbError, DriverError};
use crate::models::db_config::{ConnectionInfo, PoolCallbacks};
use crate::udbc::connection::Connection;
use crate::udbc::query::{Field, QueryDescriptor, QueryResult, Row, RowMode, command_of};
use crate::udbc_postgres::pool::PgManager;
use crate::udbc_postgres::value_codec::{bind_params, from_pg_value};
use async_trait::async_trait;
use deadpool::managed::Object;
use futures_util::{TryStreamExt, pin_mut};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::Row as PgRow;
use tokio_postgres::types::{ToSql, Type};
use tracing::debug;

/// Maps a tokio-postgres failure, keeping the SQLSTATE and constraint for
/// classification.
pub(crate) fn driver_error(error: tokio_postgres::Error) -> DriverError {
    let Some(db_error) = error.as_db_error() else {
        let message = error.to_string();
        return DriverError::new(message).with_source(error);
    };

    let mut message = db_error.message().to_string();
    if let Some(detail) = db_error.detail() {
        if !detail.trim().is_empty() {
            message.push_str(&format!(" (detail: {})", detail));
        }
    }
    if let Some(hint) = db_error.hint() {
        if !hint.trim().is_empty() {
            message.push_str(&format!(" (hint: {})", hint));
        }
    }
    let code = db_error.code().code().to_string();
    let constraint = db_error.constraint().map(str::to_string);

    let mut out = DriverError::new(message).with_code(code);
    if let Some(constraint) = constraint {
        out = out.with_constraint(constraint);
    }
    out.with_source(error)
}

/// A pooled connection leased to one client.
pub struct PgConnection {
    info: ConnectionInfo,
    conn: Mutex<Option<Object<PgManager>>>,
    callbacks: PoolCallbacks,
}

impl PgConnection {
    pub fn new(object: Object<PgManager>, callbacks: PoolCallbacks) -> Self {
        Self {
            info: object.info,
            conn: Mutex::new(Some(object)),
            callbacks,
        }
    }

    fn map_row(row: &PgRow, mode: RowMode) -> Result<Row, DriverError> {
        match mode {
            RowMode::Array => (0..row.len())
                .map(|i| from_pg_value(row, i))
                .collect::<Result<Vec<_>, _>>()
                .map(Row::Array),
            RowMode::Object => {
                let mut out = HashMap::with_capacity(row.len());
                for (i, column) in row.columns().iter().enumerate() {
                    out.insert(column.name().to_string(), from_pg_value(row, i)?);
                }
                Ok(Row::Object(out))
            }
        }
    }
}

#[async_trait]
impl Connection for PgConnection {
    fn id(&self) -> u64 {
        self.info.id
    }

    async fn query(&self, query: &QueryDescriptor) -> Result<QueryResult, DriverError> {
        let guard = self.conn.lock().await;
        let Some(object) = guard.as_ref() else {
            return Err(DriverError::new("connection has been returned to the pool"));
        };
        let client = &object.client;

        let statement = match &query.types {
            Some(oids) => {
                let types = oids
                    .iter()
                    .map(|oid| {
                        Type::from_oid(*oid)
                            .ok_or_else(|| DriverError::new(format!("unknown type oid {}", oid)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                client.prepare_typed(&query.text, &types).await
            }
            None => client.prepare(&query.text).await,
        }
        .map_err(driver_error)?;

        if let Some(name) = &query.name {
            debug!(connection = self.info.id, name = %name, "statement name ignored");
        }
        let row_mode = query.effective_row_mode();
        let params = bind_params(&query.values, statement.params())?;

        let stream = client
            .query_raw(&statement, params.iter().map(|p| p as &(dyn ToSql + Sync)))
            .await
            .map_err(driver_error)?;
        pin_mut!(stream);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(driver_error)? {
            rows.push(Self::map_row(&row, row_mode)?);
        }
        let row_count = stream.rows_affected().unwrap_or(rows.len() as u64);

        let fields = statement
            .columns()
            .iter()
            .map(|c| Field {
                name: c.name().to_string(),
                type_oid: c.type_().oid(),
            })
            .collect();

        Ok(QueryResult {
            command: command_of(&query.text),
            row_count,
            fields,
            rows,
        })
    }

    async fn release(&self) -> Result<(), DbError> {
        let Some(object) = self.conn.lock().await.take() else {
            return Err(DbError::Released);
        };
        if object.client.is_closed() {
            // keep a dead connection out of the pool
            let client = Object::take(object);
            self.callbacks.removed(&client.info);
        } else {
            drop(object);
        }
        self.callbacks.released(None, &self.info);
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.conn.get_mut().take().is_some() {
            self.callbacks.released(None, &self.info);
        }
    }
}
