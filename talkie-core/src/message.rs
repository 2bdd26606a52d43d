//! Structured message: an insertion-ordered map from key to [`Value`].
//!
//! Order is kept so that decoding a compact buffer and encoding it again gives
//! back the same bytes, which the checksum depends on.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::protocol::{key, MessageCode};

/// Field value: unsigned integer, text, or anything else JSON can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(u64),
    Text(String),
    Nested(serde_json::Value),
}

impl Value {
    pub fn as_integer(&self) -> Option<u64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Number(ref n) if n.is_u64() => {
                Value::Integer(n.as_u64().unwrap_or_default())
            }
            other => Value::Nested(other),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(v.into())
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Integer(v.into())
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Integer(v as u64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Nested(serde_json::Value::Bool(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Nested(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Integer(v) => serializer.serialize_u64(*v),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Nested(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(d).map(Value::from)
    }
}

/// One protocol message. At most one value per key.
#[derive(Debug, Clone, Default)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with only its code set.
    pub fn with_code(code: MessageCode) -> Self {
        let mut m = Self::new();
        m.set(key::MESSAGE, code);
        m
    }

    /// Builder form of [`Message::set`].
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_integer(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_integer)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_text)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace the value in place, or append the field if it is new.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    /// Set the field and move it to the front.
    pub fn set_first(&mut self, key: &str, value: impl Into<Value>) {
        self.remove(key);
        self.fields.insert(0, (key.to_string(), value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Message code, if present and known.
    pub fn code(&self) -> Option<MessageCode> {
        self.get_integer(key::MESSAGE)
            .and_then(|v| MessageCode::try_from(v).ok())
    }

    /// Identity, if present and within 16 bits.
    pub fn identity(&self) -> Option<u16> {
        self.get_integer(key::IDENTITY)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn from_name(&self) -> Option<&str> {
        self.get_text(key::FROM)
    }
}

/// Field-set equality; order is not significant.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct MessageVisitor;

        impl<'de> Visitor<'de> for MessageVisitor {
            type Value = Message;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a flat object of keys to values")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Message, M::Error> {
                let mut message = Message::new();
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    if message.contains(&k) {
                        return Err(de::Error::custom(format!("duplicate key {k:?}")));
                    }
                    message.fields.push((k, v));
                }
                Ok(message)
            }
        }

        d.deserialize_map(MessageVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_position() {
        let mut m = Message::with_code(MessageCode::Run)
            .field(key::NAME, "buzz")
            .field(key::TO, "Buzzer");
        m.set(key::NAME, "print");
        let keys: Vec<_> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["m", "n", "t"]);
        assert_eq!(m.get_text(key::NAME), Some("print"));
    }

    #[test]
    fn set_first_moves_field() {
        let mut m = Message::with_code(MessageCode::Talk).field(key::CHECKSUM, 9u64);
        m.set_first(key::CHECKSUM, 0u64);
        assert_eq!(m.iter().next(), Some(("c", &Value::Integer(0))));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn equality_ignores_order() {
        let a = Message::new().field("m", 1u64).field("t", "*");
        let b = Message::new().field("t", "*").field("m", 1u64);
        assert_eq!(a, b);
        assert_ne!(a, b.clone().field("i", 3u64));
    }

    #[test]
    fn identity_must_fit_16_bits() {
        let m = Message::new().field(key::IDENTITY, 70000u64);
        assert_eq!(m.identity(), None);
        let m = Message::new().field(key::IDENTITY, 65535u64);
        assert_eq!(m.identity(), Some(65535));
    }

    #[test]
    fn unknown_code_is_none() {
        let m = Message::new().field(key::MESSAGE, 42u64);
        assert_eq!(m.code(), None);
    }
}
