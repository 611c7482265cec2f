//! The dynamic data model flowing through the task graph.
//!
//! Every argument leaf and every task result is a [`Value`]. The model is
//! deliberately small so that it has exactly one canonical hash and one
//! canonical on-disk encoding: CBOR, written with `ciborium`.
//!
//! Arbitrary Rust types enter and leave the model through `serde`:
//! [`Value::from_serialize`] and [`Value::deserialize`] go through
//! `ciborium`'s own value tree, so anything that can be written as CBOR
//! without tags, with text map keys and with integers that fit in `i64` has
//! a stable identity.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use ciborium::value::Value as Cbor;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Converts any serializable value into the graph's data model.
    ///
    /// Fails with [`Error::UnhashableValue`] when the value has no canonical
    /// representation, e.g. a map with non-text keys or a non-finite float.
    pub fn from_serialize<T>(value: &T) -> Result<Value, Error>
    where
        T: Serialize + ?Sized,
    {
        let cbor = Cbor::serialized(value).map_err(|e| Error::unhashable(e.to_string()))?;
        Value::from_cbor_value(cbor)
    }

    /// Converts this value into any deserializable type.
    pub fn deserialize<T>(&self) -> anyhow::Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(self.to_cbor_value().deserialized()?)
    }

    /// Encodes the value as a CBOR blob, the format used by storages.
    pub fn to_cbor(&self) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(&self.to_cbor_value(), &mut buffer).map_err(std::io::Error::other)?;
        Ok(buffer)
    }

    /// Decodes a blob written by [`Value::to_cbor`].
    pub fn from_cbor(blob: &[u8]) -> Result<Value, Error> {
        let cbor: Cbor = ciborium::from_reader(blob)
            .map_err(|e| Error::InvalidState(format!("corrupt CBOR blob: {e}")))?;
        Value::from_cbor_value(cbor)
    }

    fn from_cbor_value(cbor: Cbor) -> Result<Value, Error> {
        Ok(match cbor {
            Cbor::Null => Value::Null,
            Cbor::Bool(b) => Value::Bool(b),
            Cbor::Integer(int) => {
                let wide = i128::from(int);
                let narrow = i64::try_from(wide)
                    .map_err(|_| Error::unhashable(format!("integer {wide} does not fit in i64")))?;
                Value::Integer(narrow)
            }
            Cbor::Float(float) => Value::float(float)?,
            Cbor::Text(text) => Value::Text(text),
            Cbor::Bytes(bytes) => Value::Bytes(bytes),
            Cbor::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_cbor_value)
                    .collect::<Result<_, _>>()?,
            ),
            Cbor::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let Cbor::Text(key) = key else {
                        return Err(Error::unhashable(format!(
                            "map key {key:?} is not a string"
                        )));
                    };
                    map.insert(key, Value::from_cbor_value(value)?);
                }
                Value::Map(map)
            }
            Cbor::Tag(tag, _) => {
                return Err(Error::unhashable(format!("tagged CBOR item ({tag})")));
            }
            other => {
                return Err(Error::unhashable(format!("unsupported CBOR item {other:?}")));
            }
        })
    }

    fn to_cbor_value(&self) -> Cbor {
        match self {
            Value::Null => Cbor::Null,
            Value::Bool(b) => Cbor::Bool(*b),
            Value::Integer(i) => Cbor::Integer((*i).into()),
            Value::Float(f) => Cbor::Float(*f),
            Value::Text(s) => Cbor::Text(s.clone()),
            Value::Bytes(b) => Cbor::Bytes(b.clone()),
            Value::List(items) => Cbor::Array(items.iter().map(Value::to_cbor_value).collect()),
            Value::Map(map) => Cbor::Map(
                map.iter()
                    .map(|(k, v)| (Cbor::Text(k.clone()), v.to_cbor_value()))
                    .collect(),
            ),
        }
    }

    /// Builds a float value, rejecting NaN and infinities.
    pub fn float(value: f64) -> Result<Value, Error> {
        if value.is_finite() {
            Ok(Value::Float(value))
        } else {
            Err(Error::unhashable(format!("non-finite float {value}")))
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and integers widened to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a field of a map value.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Looks up an element of a list value.
    pub fn index(&self, index: usize) -> Option<&Value> {
        self.as_list().and_then(|items| items.get(index))
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

/// Non-finite floats are kept as-is here and rejected when hashed.
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl<T> From<Vec<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T> From<BTreeMap<String, T>> for Value
where
    T: Into<Value>,
{
    fn from(value: BTreeMap<String, T>) -> Self {
        Value::Map(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Geometry {
        name: String,
        atoms: Vec<(String, [f64; 3])>,
        charge: Option<i32>,
    }

    #[test]
    fn test_struct_roundtrip() {
        let geometry = Geometry {
            name: "water".into(),
            atoms: vec![
                ("O".into(), [0.0, 0.0, 0.0]),
                ("H".into(), [0.0, 0.76, 0.59]),
            ],
            charge: None,
        };

        let value = Value::from_serialize(&geometry).unwrap();
        assert_eq!(value.field("name").and_then(Value::as_str), Some("water"));
        assert!(value.field("charge").unwrap().is_null());

        let back: Geometry = value.deserialize().unwrap();
        assert_eq!(back, geometry);
    }

    #[test]
    fn test_non_text_keys_are_unhashable() {
        let mut map = HashMap::new();
        map.insert(1u8, "one");

        let err = Value::from_serialize(&map).unwrap_err();
        assert!(matches!(err, Error::UnhashableValue(_)));
    }

    #[test]
    fn test_huge_integer_is_unhashable() {
        let err = Value::from_serialize(&u64::MAX).unwrap_err();
        assert!(matches!(err, Error::UnhashableValue(_)));
    }

    #[test]
    fn test_nan_is_unhashable() {
        assert!(Value::float(f64::NAN).is_err());
        assert!(Value::from_serialize(&f64::INFINITY).is_err());
    }

    #[test]
    fn test_cbor_blob() {
        let value = Value::from(serde_json::json!({
            "energy": -76.4,
            "converged": true,
            "steps": [1, 2, 3],
        }));

        let blob = value.to_cbor().unwrap();
        assert_eq!(Value::from_cbor(&blob).unwrap(), value);
        assert!(Value::from_cbor(&blob[..blob.len() / 2]).is_err());
    }

    #[test]
    fn test_display() {
        let value = Value::from(serde_json::json!({"a": [1, "x"], "b": null}));
        assert_eq!(value.to_string(), r#"{"a": [1, "x"], "b": null}"#);
    }
}
