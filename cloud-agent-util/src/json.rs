use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub fn deserialize_optional_duration_from_secs<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<u64> = Deserialize::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}

/// Truthiness of a JSON value.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are all "empty".
pub fn is_empty(value: &serde_json::Value) -> bool {
    use serde_json::Value;

    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}
