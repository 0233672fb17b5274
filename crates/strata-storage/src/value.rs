//! Column values and composite index keys

use crate::codec::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use strata_common::{Error, ObjectId, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_ID: u8 = 5;

/// A single column value
///
/// Ordering: `Null < Bool < numeric < Text < Id`. Integers and floats share
/// one numeric domain and compare by value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Id(ObjectId),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Text(_) => 3,
            Self::Id(_) => 4,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn encode(&self, enc: &mut Encoder) {
        match self {
            Self::Null => enc.put_u8(TAG_NULL),
            Self::Bool(v) => {
                enc.put_u8(TAG_BOOL);
                enc.put_bool(*v);
            }
            Self::Int(v) => {
                enc.put_u8(TAG_INT);
                enc.put_i64(*v);
            }
            Self::Float(v) => {
                enc.put_u8(TAG_FLOAT);
                enc.put_f64(*v);
            }
            Self::Text(v) => {
                enc.put_u8(TAG_TEXT);
                enc.put_str(v);
            }
            Self::Id(v) => {
                enc.put_u8(TAG_ID);
                enc.put_object_id(v);
            }
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        match dec.get_u8()? {
            TAG_NULL => Ok(Self::Null),
            TAG_BOOL => Ok(Self::Bool(dec.get_bool()?)),
            TAG_INT => Ok(Self::Int(dec.get_i64()?)),
            TAG_FLOAT => Ok(Self::Float(dec.get_f64()?)),
            TAG_TEXT => Ok(Self::Text(dec.get_str()?)),
            TAG_ID => Ok(Self::Id(dec.get_object_id()?)),
            tag => Err(Error::deserialization(format!("unknown value tag {tag}"))),
        }
    }
}

/// 2^63 as a float, the first value past `i64::MAX`
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Exact order of an integer against a float; NaNs sort at the ends as
/// `f64::total_cmp` puts them
fn int_float_cmp(x: i64, y: f64) -> Ordering {
    if y.is_nan() {
        return if y.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if y >= I64_BOUND {
        return Ordering::Less;
    }
    if y < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = y.trunc();
    // integral and in range, so the cast is exact
    match x.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(y - whole)).unwrap_or(Ordering::Equal),
        ord => ord,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        // -0.0 and 0.0 are one key
        (Value::Float(x), Value::Float(y)) if x == y => Ordering::Equal,
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Int(x), Value::Float(y)) => int_float_cmp(*x, *y),
        (Value::Float(x), Value::Int(y)) => int_float_cmp(*y, *x).reverse(),
        _ => Ordering::Equal,
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Id(a), Self::Id(b)) => a.cmp(b),
            (Self::Null, Self::Null) => Ordering::Equal,
            _ => numeric_cmp(self, other),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Id(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Self::Id(v)
    }
}

/// Composite index key, compared element-wise with shorter prefixes first
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    #[must_use]
    pub fn single(value: Value) -> Self {
        Self(vec![value])
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u16(self.0.len() as u16);
        for value in &self.0 {
            value.encode(enc);
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let n = dec.get_u16()? as usize;
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(Value::decode(dec)?);
        }
        Ok(Self(values))
    }
}

impl From<Value> for IndexKey {
    fn from(value: Value) -> Self {
        Self::single(value)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.0.as_slice() {
            return write!(f, "{only}");
        }
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_type_order() {
        let ordered = [
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(-3),
            Value::Float(-2.5),
            Value::Int(0),
            Value::Float(0.5),
            Value::Int(10),
            Value::Text("a".into()),
            Value::Text("b".into()),
            Value::Id(ObjectId::from_slot(1)),
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_int_float_equal_by_value() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_eq!(Value::Int(0), Value::Float(-0.0));
        assert_eq!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_int_float_order_is_exact() {
        let big = 1i64 << 53;
        // 2^53 + 1 has no f64 representation and rounds to 2^53
        assert!(Value::Int(big + 1) > Value::Float(big as f64));
        assert_eq!(Value::Int(big), Value::Float(big as f64));
        assert!(Value::Float(big as f64) < Value::Int(big + 1));

        assert!(Value::Int(i64::MAX) < Value::Float(I64_BOUND));
        assert!(Value::Int(i64::MIN) == Value::Float(-I64_BOUND));
        assert!(Value::Int(i64::MIN) > Value::Float(f64::NEG_INFINITY));

        assert!(Value::Int(2) < Value::Float(2.5));
        assert!(Value::Int(3) > Value::Float(2.5));
        assert!(Value::Int(-3) < Value::Float(-2.5));
        assert!(Value::Int(-2) > Value::Float(-2.5));

        assert!(Value::Int(i64::MAX) < Value::Float(f64::NAN));
        assert!(Value::Int(i64::MIN) > Value::Float(-f64::NAN));
    }

    #[test]
    fn test_composite_prefix_first() {
        let short = IndexKey(vec![Value::Int(1)]);
        let long = IndexKey(vec![Value::Int(1), Value::Null]);
        let other = IndexKey(vec![Value::Int(2)]);
        assert!(short < long);
        assert!(long < other);
    }

    #[test]
    fn test_key_codec() {
        let key = IndexKey(vec![
            Value::Text("alice".into()),
            Value::Float(f64::NAN),
            Value::Id(ObjectId::new()),
            Value::Null,
        ]);
        let mut enc = Encoder::new();
        key.encode(&mut enc);
        let bytes = enc.finish();
        let decoded = IndexKey::decode(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, key);
    }
}
