//! Discovery payload parsing.
//!
//! Agents report discovered resources as a JSON document: either a top-level
//! array of objects or an object with a `data` array (the legacy envelope).
//! Each array element becomes one read-only [`DiscoveryRow`].

use serde_json::Value;

use crate::error::{DiscoveryError, DiscoveryResult};

/// One discovered JSON row, queried but never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRow {
    object: serde_json::Map<String, Value>,
}

impl DiscoveryRow {
    /// Wraps a JSON object as a discovery row.
    #[must_use]
    pub fn new(object: serde_json::Map<String, Value>) -> Self {
        Self { object }
    }

    /// Returns a top-level field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.object.get(name)
    }

    /// Iterates over the row's top-level fields.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.object.iter()
    }

    /// Resolves a dotted path expression against the row.
    ///
    /// Supported forms: `$.name`, `$.a.b`, `$.a[0].b` and the same without
    /// the leading `$.`. Returns `None` when any segment is missing or the
    /// path syntax is not understood.
    #[must_use]
    pub fn query(&self, path: &str) -> Option<&Value> {
        let rest = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
        if rest.is_empty() {
            return None;
        }

        let mut current: Option<&Value> = None;
        for segment in rest.split('.') {
            if segment.is_empty() {
                return None;
            }

            let (member, indexes) = split_indexes(segment)?;
            let next = if let Some(container) = current {
                container.as_object()?.get(member)?
            } else {
                self.object.get(member)?
            };

            let mut value = next;
            for idx in indexes {
                value = value.as_array()?.get(idx)?;
            }
            current = Some(value);
        }
        current
    }
}

/// Splits `name[0][1]` into the member name and its array indexes.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };

    let member = &segment[..bracket];
    let mut indexes = Vec::new();
    let mut rest = &segment[bracket..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indexes.push(inner[..close].parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((member, indexes))
}

/// Parses a discovery payload into rows.
///
/// Accepts a top-level JSON array or an object wrapping the array in a
/// `data` member. Anything else, including non-object array elements, is a
/// malformed payload and aborts the rule run.
///
/// # Errors
///
/// Returns [`DiscoveryError::MalformedInput`] on invalid JSON or an
/// unexpected document shape.
pub fn parse_payload(raw: &str) -> DiscoveryResult<Vec<DiscoveryRow>> {
    let document: Value = serde_json::from_str(raw)
        .map_err(|e| DiscoveryError::malformed(format!("cannot parse value: {e}")))?;

    let array = match document {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(DiscoveryError::malformed(
                    "the \"data\" member is not an array",
                ))
            }
            None => {
                return Err(DiscoveryError::malformed(
                    "missing \"data\" array member",
                ))
            }
        },
        _ => {
            return Err(DiscoveryError::malformed(
                "expected an array or an object with a \"data\" array",
            ))
        }
    };

    let mut rows = Vec::with_capacity(array.len());
    for (i, element) in array.into_iter().enumerate() {
        match element {
            Value::Object(object) => rows.push(DiscoveryRow::new(object)),
            other => {
                return Err(DiscoveryError::malformed(format!(
                    "array element {i} is not an object: {other}"
                )))
            }
        }
    }
    Ok(rows)
}
