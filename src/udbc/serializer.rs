//! `serde::Serializer` producing [`Value`]s.
//!
//! Used for positional query parameters and for flattening [`PoolOptions`]
//! into the map the config normalizer works on.
//!
//! [`PoolOptions`]: crate::models::db_config::PoolOptions

use crate::error::DbError;
use crate::udbc::value::Value;
use serde::Serialize;
use serde::ser::*;

use std::collections::HashMap;

impl serde::ser::Error for DbError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        DbError::Value(msg.to_string())
    }
}

pub struct ValueSerializer;

fn unsupported(what: &str) -> DbError {
    DbError::Value(format!("{} cannot be converted to a query value", what))
}

impl Serializer for ValueSerializer {
    type Ok = Value;
    type Error = DbError;
    type SerializeSeq = ListSerializer;
    type SerializeTuple = ListSerializer;
    type SerializeTupleStruct = ListSerializer;
    type SerializeTupleVariant = Impossible<Value, DbError>;
    type SerializeMap = Impossible<Value, DbError>;
    type SerializeStruct = StructSerializer;
    type SerializeStructVariant = Impossible<Value, DbError>;

    fn serialize_bool(self, v: bool) -> Result<Value, DbError> {
        Ok(Value::Bool(v))
    }
    fn serialize_i8(self, v: i8) -> Result<Value, DbError> {
        Ok(Value::I16(v as i16))
    }
    fn serialize_i16(self, v: i16) -> Result<Value, DbError> {
        Ok(Value::I16(v))
    }
    fn serialize_i32(self, v: i32) -> Result<Value, DbError> {
        Ok(Value::I32(v))
    }
    fn serialize_i64(self, v: i64) -> Result<Value, DbError> {
        Ok(Value::I64(v))
    }
    fn serialize_u8(self, v: u8) -> Result<Value, DbError> {
        Ok(Value::U8(v))
    }
    fn serialize_u16(self, v: u16) -> Result<Value, DbError> {
        Ok(Value::I32(v as i32))
    }
    fn serialize_u32(self, v: u32) -> Result<Value, DbError> {
        Ok(Value::I64(v as i64))
    }
    fn serialize_u64(self, v: u64) -> Result<Value, DbError> {
        i64::try_from(v)
            .map(Value::I64)
            .map_err(|_| DbError::Value(format!("{} does not fit in a signed 64-bit column", v)))
    }
    fn serialize_f32(self, v: f32) -> Result<Value, DbError> {
        Ok(Value::F32(v))
    }
    fn serialize_f64(self, v: f64) -> Result<Value, DbError> {
        Ok(Value::F64(v))
    }
    fn serialize_char(self, v: char) -> Result<Value, DbError> {
        Ok(Value::Str(v.to_string()))
    }
    fn serialize_str(self, v: &str) -> Result<Value, DbError> {
        Ok(Value::Str(v.to_string()))
    }
    fn serialize_bytes(self, v: &[u8]) -> Result<Value, DbError> {
        Ok(Value::Bytes(v.to_vec()))
    }
    fn serialize_none(self) -> Result<Value, DbError> {
        Ok(Value::Null)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Value, DbError> {
        value.serialize(self)
    }
    // `()` means "no parameters"
    fn serialize_unit(self) -> Result<Value, DbError> {
        Ok(Value::List(vec![]))
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<Value, DbError> {
        Ok(Value::Null)
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
    ) -> Result<Value, DbError> {
        Ok(Value::Str(variant.to_string()))
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<Value, DbError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<Value, DbError> {
        Err(unsupported(name))
    }
    fn serialize_seq(self, len: Option<usize>) -> Result<ListSerializer, DbError> {
        Ok(ListSerializer {
            vec: Vec::with_capacity(len.unwrap_or(0)),
        })
    }
    fn serialize_tuple(self, len: usize) -> Result<ListSerializer, DbError> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_struct(self, _: &'static str, len: usize) -> Result<ListSerializer, DbError> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, DbError> {
        Err(unsupported(name))
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, DbError> {
        Err(unsupported("a map"))
    }
    fn serialize_struct(self, _: &'static str, len: usize) -> Result<StructSerializer, DbError> {
        Ok(StructSerializer {
            map: HashMap::with_capacity(len),
        })
    }
    fn serialize_struct_variant(
        self,
        name: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, DbError> {
        Err(unsupported(name))
    }
}

pub struct ListSerializer {
    vec: Vec<Value>,
}

macro_rules! impl_serialize_seq {
    ($trait:ident, $method:ident) => {
        impl $trait for ListSerializer {
            type Ok = Value;
            type Error = DbError;

            fn $method<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
                self.vec.push(value.serialize(ValueSerializer)?);
                Ok(())
            }

            fn end(self) -> Result<Self::Ok, Self::Error> {
                Ok(Value::List(self.vec))
            }
        }
    };
}

impl_serialize_seq!(SerializeSeq, serialize_element);
impl_serialize_seq!(SerializeTuple, serialize_element);
impl_serialize_seq!(SerializeTupleStruct, serialize_field);

pub struct StructSerializer {
    map: HashMap<String, Value>,
}

impl SerializeStruct for StructSerializer {
    type Ok = Value;
    type Error = DbError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        let v = value.serialize(ValueSerializer)?;
        self.map.insert(key.to_string(), v);
        Ok(())
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Map(self.map))
    }
}

pub fn to_value<T: Serialize + ?Sized>(t: &T) -> Result<Value, DbError> {
    t.serialize(ValueSerializer)
}

/// Serializes a struct into its field map.
pub fn to_map<T: Serialize + ?Sized>(t: &T) -> Result<HashMap<String, Value>, DbError> {
    match to_value(t)? {
        Value::Map(map) => Ok(map),
        other => Err(DbError::Value(format!("expected a map, got {:?}", other))),
    }
}
