//! Boundary coercion for identifiers that arrive as JSON text.
//!
//! Admin backends frequently serialize BIGINT columns as strings. Records are
//! coerced here once so the rest of the engine only sees typed numbers.

use serde::{de, Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Int(i64),
    Float(f64),
    Text(String),
}

fn coerce<E: de::Error>(raw: NumberOrText) -> Result<i64, E> {
    match raw {
        NumberOrText::Int(v) => Ok(v),
        NumberOrText::Float(v) if v.fract() == 0.0 && v.is_finite() => Ok(v as i64),
        NumberOrText::Float(v) => Err(E::custom(format!("expected integer, got {v}"))),
        NumberOrText::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| E::custom(format!("invalid integer '{s}': {e}"))),
    }
}

pub fn i64_lenient<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    coerce(NumberOrText::deserialize(deserializer)?)
}

pub fn i32_lenient<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let v = coerce::<D::Error>(NumberOrText::deserialize(deserializer)?)?;
    i32::try_from(v).map_err(|_| de::Error::custom(format!("integer {v} out of range")))
}

pub fn opt_i32_lenient<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(raw) => {
            let v = coerce::<D::Error>(raw)?;
            i32::try_from(v)
                .map(Some)
                .map_err(|_| de::Error::custom(format!("integer {v} out of range")))
        }
    }
}
