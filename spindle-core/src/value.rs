//! Dynamically typed values passed between controllers, servers and workers.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

const UNIT_TYPE_NAME: &str = "unit";
const BOOL_TYPE_NAME: &str = "bool";
const INT_TYPE_NAME: &str = "int";
const FLOAT_TYPE_NAME: &str = "float";
const STR_TYPE_NAME: &str = "str";
const BYTES_TYPE_NAME: &str = "bytes";
const LIST_TYPE_NAME: &str = "list";
const MAP_TYPE_NAME: &str = "map";

/// Defines all possible types of values.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ValueType {
    Unit,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl ValueType {
    pub fn to_str(&self) -> &'static str {
        match self {
            ValueType::Unit => UNIT_TYPE_NAME,
            ValueType::Bool => BOOL_TYPE_NAME,
            ValueType::Int => INT_TYPE_NAME,
            ValueType::Float => FLOAT_TYPE_NAME,
            ValueType::String => STR_TYPE_NAME,
            ValueType::Bytes => BYTES_TYPE_NAME,
            ValueType::List => LIST_TYPE_NAME,
            ValueType::Map => MAP_TYPE_NAME,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Value used for procedure arguments, task and job arguments, tube traffic
/// and results.
///
/// Arbitrary serializable structures can be carried inside `Bytes` using
/// [`Value::pack`] and [`Value::unpack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Unit
    }
}

impl Value {
    pub fn get_type(&self) -> ValueType {
        match self {
            Value::Unit => ValueType::Unit,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::List(_) => ValueType::List,
            Value::Map(_) => ValueType::Map,
        }
    }

    /// Serializes any structure into a `Bytes` value.
    pub fn pack<T: Serialize>(obj: &T) -> Result<Value> {
        Ok(Value::Bytes(bincode::serialize(obj)?))
    }

    /// Deserializes a structure previously stored with [`Value::pack`].
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Bytes(bytes) => Ok(bincode::deserialize(bytes)?),
            _ => Err(self.wrong_type(ValueType::Bytes)),
        }
    }

    fn wrong_type(&self, expected: ValueType) -> Error {
        Error::InvalidValueType {
            expected: expected.to_string(),
            found: self.get_type().to_string(),
        }
    }

    pub fn is_unit(&self) -> bool {
        match self {
            Value::Unit => true,
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(self.wrong_type(ValueType::Bool)),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(self.wrong_type(ValueType::Int)),
        }
    }

    /// Returns the value as a non-negative integer usable as an index or a
    /// count.
    pub fn as_usize(&self) -> Result<usize> {
        let i = self.as_int()?;
        if i < 0 {
            return Err(Error::ParsingError(format!(
                "expected non-negative integer, got {}",
                i
            )));
        }
        Ok(i as usize)
    }

    /// Integers are converted to floats.
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(self.wrong_type(ValueType::Float)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(self.wrong_type(ValueType::String)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(self.wrong_type(ValueType::Bytes)),
        }
    }

    pub fn as_list(&self) -> Result<&Vec<Value>> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(self.wrong_type(ValueType::List)),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(self.wrong_type(ValueType::List)),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Ok(m),
            _ => Err(self.wrong_type(ValueType::Map)),
        }
    }

    /// Gets an element of a list value.
    pub fn at(&self, index: usize) -> Result<&Value> {
        self.as_list()?
            .get(index)
            .ok_or(Error::MissingElement(index))
    }

    /// Gets an entry of a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(l) => {
                write!(f, "[")?;
                for (n, v) in l.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (n, (k, v)) in m.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_report_expected_type() {
        let v = Value::from("text");
        assert_eq!(v.as_str().unwrap(), "text");
        match v.as_int() {
            Err(Error::InvalidValueType { expected, found }) => {
                assert_eq!(expected, "int");
                assert_eq!(found, "str");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn int_widens_to_float() {
        assert_eq!(Value::Int(3).as_float().unwrap(), 3.0);
        assert!(Value::Int(-1).as_usize().is_err());
    }

    #[test]
    fn packed_structures_survive() {
        let original = vec![(1u32, "a".to_string()), (2, "b".to_string())];
        let packed = Value::pack(&original).unwrap();
        let unpacked: Vec<(u32, String)> = packed.unpack().unwrap();
        assert_eq!(original, unpacked);
        assert!(Value::Int(1).unpack::<u32>().is_err());
    }

    #[test]
    fn display_nested() {
        let v = Value::List(vec![Value::Int(1), Value::List(vec![Value::Bool(true)])]);
        assert_eq!(v.to_string(), "[1, [true]]");
    }
}
