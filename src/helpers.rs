use crate::udbc::value::Value;
use std::collections::HashMap;

/// Removes every key whose value is [`Value::Null`] and hands the same map back.
///
/// Only nulls go: `0`, `false` and `""` are real settings and are kept.
pub fn remove_nulls(map: &mut HashMap<String, Value>) -> &mut HashMap<String, Value> {
    map.retain(|_, v| !v.is_null());
    map
}
