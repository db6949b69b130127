//! Decodes a normalized `Value` map into a typed struct.
//!
//! Drivers use this to read their configuration out of the null-stripped map
//! handed over by the manager: a key that is absent falls back to the field's
//! `#[serde(default)]`, which is how driver defaults win over unset options.

use crate::error::DbError;
use crate::udbc::value::Value;
use serde::de::{self, Deserializer, IntoDeserializer, MapAccess, Visitor};
use std::collections::HashMap;

pub struct MapDeserializer<'a> {
    map: &'a HashMap<String, Value>,
}

impl<'a> MapDeserializer<'a> {
    pub fn new(map: &'a HashMap<String, Value>) -> Self {
        Self { map }
    }
}

impl<'de, 'a> Deserializer<'de> for MapDeserializer<'a> {
    type Error = DbError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        visitor.visit_map(ValueMapAccess::new(self.map))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 u8 u16 u32 u64 f32 f64 char str string
        unit seq tuple tuple_struct map struct enum identifier ignored_any
        unit_struct newtype_struct bytes byte_buf option
    }
}

struct ValueMapAccess<'a> {
    iter: std::collections::hash_map::Iter<'a, String, Value>,
    current: Option<&'a Value>,
}

impl<'a> ValueMapAccess<'a> {
    fn new(map: &'a HashMap<String, Value>) -> Self {
        Self {
            iter: map.iter(),
            current: None,
        }
    }
}

impl<'de, 'a> MapAccess<'de> for ValueMapAccess<'a> {
    type Error = DbError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((k, v)) => {
                self.current = Some(v);
                seed.deserialize(k.as_str().into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: de::DeserializeSeed<'de>,
    {
        let value = self
            .current
            .take()
            .ok_or_else(|| DbError::Configuration("value requested before key".into()))?;
        seed.deserialize(ValueDeserializer { value })
    }
}

pub struct ValueDeserializer<'a> {
    pub value: &'a Value,
}

impl<'de, 'a> Deserializer<'de> for ValueDeserializer<'a> {
    type Error = DbError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.value {
            Value::Null => visitor.visit_unit(),
            Value::Bool(v) => visitor.visit_bool(*v),
            Value::I16(v) => visitor.visit_i16(*v),
            Value::I32(v) => visitor.visit_i32(*v),
            Value::I64(v) => visitor.visit_i64(*v),
            Value::U8(v) => visitor.visit_u8(*v),
            Value::F32(v) => visitor.visit_f32(*v),
            Value::F64(v) => visitor.visit_f64(*v),
            Value::Str(v) => visitor.visit_str(v),
            Value::Bytes(v) => visitor.visit_bytes(v),
            Value::Date(d) => visitor.visit_string(d.to_string()),
            Value::Time(t) => visitor.visit_string(t.to_string()),
            Value::DateTime(dt) => visitor.visit_string(dt.to_string()),
            Value::DateTimeUtc(dt) => visitor.visit_string(dt.to_rfc3339()),
            Value::Decimal(d) => visitor.visit_string(d.to_string()),
            Value::Uuid(u) => visitor.visit_string(u.to_string()),
            Value::Json(j) => visitor.visit_string(j.to_string()),
            Value::List(_) => Err(DbError::Configuration(
                "list values are not supported here".into(),
            )),
            Value::Map(map) => visitor.visit_map(ValueMapAccess::new(map)),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.value {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 u8 u16 u32 u64 f32 f64 char str string
        unit seq tuple tuple_struct map struct enum identifier
        unit_struct newtype_struct bytes byte_buf
    }
}
