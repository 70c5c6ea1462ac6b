//! JSON-backed event type.
//!
//! Decoded stream messages become [`Event`]s before they reach the dispatch
//! engine. Field order is preserved from the wire, and field order is the
//! order the matching engine walks.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::pattern::{AttrValue, EventPattern, Scalar};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Ordered attribute map published through the dispatch engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    /// Creates an empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(EventError::NotAnObject(json_kind(&other))),
        }
    }

    /// Appends a field, keeping insertion order.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Deserializes the event into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

impl TryFrom<Value> for Event {
    type Error = EventError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Event::from_value(value)
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("{..}"),
        }
    }
}

impl EventPattern for Event {
    fn attribute_names(&self) -> Vec<String> {
        self.fields.attribute_names()
    }

    fn attribute_value(&self, name: &str) -> Option<AttrValue<'_>> {
        self.fields.attribute_value(name)
    }
}

impl EventPattern for Map<String, Value> {
    fn attribute_names(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, value)| json_attr(value).is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn attribute_value(&self, name: &str) -> Option<AttrValue<'_>> {
        self.get(name).and_then(json_attr)
    }
}

/// Maps a JSON value onto the attribute model. `null`, `""`, `{}` and `[]`
/// are unset; other arrays are compared as their compact JSON text.
fn json_attr(value: &Value) -> Option<AttrValue<'_>> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(AttrValue::Scalar(Scalar::Bool(*b))),
        Value::Number(number) => {
            let scalar = match number.as_i64() {
                Some(int) => Scalar::Int(int),
                None => Scalar::float(number.as_f64()?),
            };
            Some(AttrValue::Scalar(scalar))
        }
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(AttrValue::Scalar(Scalar::Text(text.clone()))),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(_) => Some(AttrValue::Scalar(Scalar::Text(value.to_string()))),
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => Some(AttrValue::Nested(map)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChainStep;
    use serde_json::json;

    #[test]
    fn test_field_order_is_preserved() {
        let event = Event::from_value(json!({"symbol": "AAPL", "price": 100, "exchange": "XNAS"})).unwrap();
        assert_eq!(event.attribute_names(), vec!["symbol", "price", "exchange"]);
    }

    #[test]
    fn test_empty_values_are_not_attributes() {
        let event = Event::from_value(json!({
            "symbol": "AAPL",
            "note": "",
            "venue": null,
            "tags": [],
            "meta": {}
        }))
        .unwrap();

        assert_eq!(event.attribute_names(), vec!["symbol"]);
        assert_eq!(event.attribute_count(), 1);
    }

    #[test]
    fn test_nested_object_extends_the_chain() {
        let event = Event::new()
            .with("kind", "trade")
            .with("instrument", json!({"symbol": "AAPL", "type": "equity"}));

        assert_eq!(
            event.attribute_chain(),
            vec![
                ChainStep::Name("kind".into()),
                ChainStep::Value("trade".into()),
                ChainStep::Name("instrument".into()),
                ChainStep::Name("symbol".into()),
                ChainStep::Value("AAPL".into()),
                ChainStep::Name("type".into()),
                ChainStep::Value("equity".into()),
            ]
        );
    }

    #[test]
    fn test_numbers_compare_across_representations() {
        let a = Event::new().with("price", 100);
        let b = Event::new().with("price", 100.0);
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_non_object_is_rejected() {
        let err = Event::from_value(json!([1, 2])).unwrap_err();
        assert!(matches!(err, EventError::NotAnObject("array")));
    }

    #[test]
    fn test_decode_into_typed_record() {
        #[derive(Deserialize)]
        struct Quote {
            symbol: String,
            price: f64,
        }

        let event = Event::new().with("symbol", "AAPL").with("price", 101.5);
        let quote: Quote = event.decode().unwrap();
        assert_eq!(quote.symbol, "AAPL");
        assert_eq!(quote.price, 101.5);
    }
}
