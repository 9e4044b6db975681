use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// 分片键子键的取值
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
    Decimal(Decimal),
}

/// An opaque sharding key made of ordered sub-keys.
///
/// Two keys are equal only when every sub-key is equal by value, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingKey {
    subkeys: Vec<Value>,
}

impl ShardingKey {
    pub fn new() -> Self {
        Self {
            subkeys: Vec::new(),
        }
    }

    pub fn subkey(mut self, v: impl Into<Value>) -> Self {
        self.subkeys.push(v.into());
        self
    }

    pub fn subkeys(&self) -> &[Value] {
        &self.subkeys
    }
}

impl Default for ShardingKey {
    fn default() -> Self {
        Self::new()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}
impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}
