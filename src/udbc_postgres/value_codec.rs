use crate::error::DriverError;
use crate::udbc::value::Value;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::error::Error;
use std::net::IpAddr;
use tokio_postgres::Row as PgRow;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};
use uuid::Uuid;

type BoxError = Box<dyn Error + Sync + Send>;

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql(ty, out),
            Value::I16(v) => v.to_sql(ty, out),
            Value::I32(v) => v.to_sql(ty, out),
            Value::I64(v) => v.to_sql(ty, out),
            Value::U8(v) => (*v as i16).to_sql(ty, out),
            Value::F32(v) => v.to_sql(ty, out),
            Value::F64(v) => v.to_sql(ty, out),
            // jsonb's binary form is a version byte followed by the text
            Value::Str(v) if *ty == Type::JSONB => {
                out.put_u8(1);
                out.extend_from_slice(v.as_bytes());
                Ok(IsNull::No)
            }
            Value::Str(v) => v.to_sql(ty, out),
            Value::Bytes(v) => v.to_sql(ty, out),
            Value::Date(v) => v.to_sql(ty, out),
            Value::Time(v) => v.to_sql(ty, out),
            Value::DateTime(v) => v.to_sql(ty, out),
            Value::DateTimeUtc(v) => v.to_sql(ty, out),
            Value::Decimal(v) => v.to_sql(ty, out),
            Value::Uuid(v) => v.to_sql(ty, out),
            Value::Json(v) => v.to_sql(ty, out),
            Value::List(v) => match ty.kind() {
                Kind::Array(_) => v.to_sql(ty, out),
                _ => Err(format!("a list cannot be sent as {}", ty.name()).into()),
            },
            Value::Map(_) => Err("maps cannot be bound as query parameters".into()),
        }
    }

    // parameters are coerced to the statement's types in `bind_params`
    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Fits each value to the type the server inferred for its placeholder.
pub fn bind_params(values: &[Value], types: &[Type]) -> Result<Vec<Value>, DriverError> {
    if values.len() != types.len() {
        return Err(DriverError::new(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (value, ty))| {
            coerce(value, ty).ok_or_else(|| {
                DriverError::new(format!(
                    "parameter ${} ({:?}) cannot be sent as {}",
                    i + 1,
                    value,
                    ty.name()
                ))
            })
        })
        .collect()
}

fn coerce(value: &Value, ty: &Type) -> Option<Value> {
    if let Some(i) = value.as_i64() {
        return Some(coerce_int(i, ty).unwrap_or_else(|| value.clone()));
    }
    match value {
        Value::F32(v) => Some(coerce_float(*v as f64, ty).unwrap_or_else(|| value.clone())),
        Value::F64(v) => Some(coerce_float(*v, ty).unwrap_or_else(|| value.clone())),
        Value::Str(s) => Some(coerce_str(s, ty).unwrap_or_else(|| value.clone())),
        Value::Map(_) => None,
        Value::List(items) => match ty.kind() {
            Kind::Array(member) => items
                .iter()
                .map(|item| coerce(item, member))
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            _ => None,
        },
        other => Some(other.clone()),
    }
}

fn coerce_int(i: i64, ty: &Type) -> Option<Value> {
    match *ty {
        Type::INT2 => i16::try_from(i).ok().map(Value::I16),
        Type::INT4 => i32::try_from(i).ok().map(Value::I32),
        Type::INT8 => Some(Value::I64(i)),
        Type::FLOAT4 => Some(Value::F32(i as f32)),
        Type::FLOAT8 => Some(Value::F64(i as f64)),
        Type::NUMERIC => Some(Value::Decimal(Decimal::from(i))),
        Type::TEXT | Type::VARCHAR => Some(Value::Str(i.to_string())),
        _ => None,
    }
}

fn coerce_float(f: f64, ty: &Type) -> Option<Value> {
    match *ty {
        Type::FLOAT4 => Some(Value::F32(f as f32)),
        Type::FLOAT8 => Some(Value::F64(f)),
        Type::NUMERIC => Decimal::try_from(f).ok().map(Value::Decimal),
        _ => None,
    }
}

fn coerce_str(s: &str, ty: &Type) -> Option<Value> {
    match *ty {
        Type::INT2 => s.parse().ok().map(Value::I16),
        Type::INT4 => s.parse().ok().map(Value::I32),
        Type::INT8 => s.parse().ok().map(Value::I64),
        Type::FLOAT4 => s.parse().ok().map(Value::F32),
        Type::FLOAT8 => s.parse().ok().map(Value::F64),
        Type::BOOL => s.parse().ok().map(Value::Bool),
        Type::NUMERIC => s.parse().ok().map(Value::Decimal),
        Type::DATE => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Value::Date),
        Type::TIME => s.parse::<NaiveTime>().ok().map(Value::Time),
        Type::TIMESTAMP => s.parse::<NaiveDateTime>().ok().map(Value::DateTime),
        Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Value::DateTimeUtc(dt.with_timezone(&Utc))),
        Type::UUID => Uuid::parse_str(s).ok().map(Value::Uuid),
        _ => None,
    }
}

/// Text of a column whose binary form is its text: enums, domains over text
/// and the few text-like builtins without a dedicated mapping.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(RawText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        match ty.kind() {
            Kind::Enum(_) => true,
            Kind::Domain(inner) => Self::accepts(inner),
            _ => *ty == Type::XML || <String as FromSql>::accepts(ty),
        }
    }
}

fn get<'a, T>(row: &'a PgRow, idx: usize, f: impl Fn(T) -> Value) -> Result<Value, DriverError>
where
    T: FromSql<'a>,
{
    let v: Option<T> = row.try_get(idx).map_err(super::connection::driver_error)?;
    Ok(v.map_or(Value::Null, f))
}

fn get_list<'a, T>(row: &'a PgRow, idx: usize, f: impl Fn(T) -> Value) -> Result<Value, DriverError>
where
    T: FromSql<'a>,
{
    let v: Option<Vec<Option<T>>> = row.try_get(idx).map_err(super::connection::driver_error)?;
    Ok(v.map_or(Value::Null, |items| {
        Value::List(items.into_iter().map(|i| i.map_or(Value::Null, &f)).collect())
    }))
}

pub fn from_pg_value(row: &PgRow, idx: usize) -> Result<Value, DriverError> {
    let column = &row.columns()[idx];
    let ty = column.type_().clone();
    match ty {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get(row, idx, Value::I16),
        Type::INT4 => get(row, idx, Value::I32),
        Type::INT8 => get(row, idx, Value::I64),
        Type::OID => get(row, idx, |v: u32| Value::I64(v as i64)),
        Type::FLOAT4 => get(row, idx, Value::F32),
        Type::FLOAT8 => get(row, idx, Value::F64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => get(row, idx, Value::Str),
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeUtc),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        Type::INET => get(row, idx, |v: IpAddr| Value::Str(v.to_string())),
        Type::BOOL_ARRAY => get_list(row, idx, Value::Bool),
        Type::INT2_ARRAY => get_list(row, idx, Value::I16),
        Type::INT4_ARRAY => get_list(row, idx, Value::I32),
        Type::INT8_ARRAY => get_list(row, idx, Value::I64),
        Type::FLOAT4_ARRAY => get_list(row, idx, Value::F32),
        Type::FLOAT8_ARRAY => get_list(row, idx, Value::F64),
        Type::NUMERIC_ARRAY => get_list(row, idx, Value::Decimal),
        Type::DATE_ARRAY => get_list(row, idx, Value::Date),
        Type::TIMESTAMP_ARRAY => get_list(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ_ARRAY => get_list(row, idx, Value::DateTimeUtc),
        Type::UUID_ARRAY => get_list(row, idx, Value::Uuid),
        Type::JSON_ARRAY | Type::JSONB_ARRAY => get_list(row, idx, Value::Json),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::BPCHAR_ARRAY | Type::NAME_ARRAY => {
            get_list(row, idx, Value::Str)
        }
        ref other if RawText::accepts(other) => get(row, idx, |v: RawText| Value::Str(v.0)),
        other => Err(DriverError::new(format!(
            "column \"{}\" has unsupported type {}; cast it to text",
            column.name(),
            other.name()
        ))),
    }
}
