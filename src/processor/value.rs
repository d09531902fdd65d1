//! Runtime value of the script language.

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};

use super::decimal::Decimal;
use super::error::RuntimeError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Values always own their text; nothing borrows from the box text once it
/// has been pushed on the stack.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Number(Decimal),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null or the empty string; plain writes skip empty values.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => !n.is_zero(),
            Value::Date(_) => true,
        }
    }

    /// Numeric view; null and the empty string count as zero.
    pub fn as_number(&self) -> Result<Decimal, RuntimeError> {
        match self {
            Value::Null => Ok(Decimal::ZERO),
            Value::Number(n) => Ok(*n),
            Value::String(s) if s.trim().is_empty() => Ok(Decimal::ZERO),
            Value::String(s) => Decimal::parse(s)
                .ok_or_else(|| RuntimeError::Conversion(format!("`{s}` is not a number"))),
            Value::Date(d) => Err(RuntimeError::Conversion(format!(
                "date {} used as a number",
                d.format(DATE_FORMAT)
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        self.as_number().map(Decimal::to_int)
    }

    pub fn as_date(&self) -> Result<NaiveDate, RuntimeError> {
        match self {
            Value::Date(d) => Ok(*d),
            Value::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .map_err(|_| RuntimeError::Conversion(format!("`{s}` is not a date"))),
            other => Err(RuntimeError::Conversion(format!(
                "`{other}` is not a date"
            ))),
        }
    }

    /// Ordering used by the comparison operators. `None` when the two
    /// values cannot be compared (e.g. a word against a number).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, Value::String(s)) => "".partial_cmp(s.as_str()),
            (Value::String(s), Value::Null) => s.as_str().partial_cmp(""),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.partial_cmp(b),
            (Value::Number(a), Value::String(b)) => {
                Decimal::parse(b).and_then(|b| a.partial_cmp(&b))
            }
            (Value::String(a), Value::Number(b)) => {
                Decimal::parse(a).and_then(|a| a.partial_cmp(b))
            }
            (Value::Date(a), Value::String(b)) => NaiveDate::parse_from_str(b.trim(), DATE_FORMAT)
                .ok()
                .and_then(|b| a.partial_cmp(&b)),
            (Value::String(a), Value::Date(b)) => NaiveDate::parse_from_str(a.trim(), DATE_FORMAT)
                .ok()
                .and_then(|a| a.partial_cmp(b)),
            _ => None,
        }
    }

    pub fn script_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// `+`: string concatenation when both sides are strings, null is the
    /// identity, anything else is decimal addition.
    pub fn add(&self, rhs: &Value) -> Result<Value, RuntimeError> {
        match (self, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Null, other) | (other, Value::Null) => Ok(other.clone()),
            _ => arithmetic(self, rhs, Decimal::checked_add),
        }
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value, RuntimeError> {
        arithmetic(self, rhs, Decimal::checked_sub)
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value, RuntimeError> {
        arithmetic(self, rhs, Decimal::checked_mul)
    }

    pub fn div(&self, rhs: &Value) -> Result<Value, RuntimeError> {
        if !matches!(rhs, Value::Date(_)) && rhs.as_number()?.is_zero() {
            return Err(RuntimeError::Conversion("division by zero".into()));
        }
        arithmetic(self, rhs, Decimal::checked_div)
    }

    pub fn neg(&self) -> Result<Value, RuntimeError> {
        arithmetic(&Value::Number(Decimal::ZERO), self, Decimal::checked_sub)
    }
}

fn arithmetic(
    lhs: &Value,
    rhs: &Value,
    op: fn(Decimal, Decimal) -> Option<Decimal>,
) -> Result<Value, RuntimeError> {
    if matches!(lhs, Value::Date(_)) || matches!(rhs, Value::Date(_)) {
        return Err(RuntimeError::Conversion(
            "arithmetic on dates is not supported".into(),
        ));
    }
    op(lhs.as_number()?, rhs.as_number()?)
        .map(Value::Number)
        .ok_or_else(|| RuntimeError::Conversion("numeric overflow".into()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{n}"),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            other => serializer.collect_str(other),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Decimal> for Value {
    fn from(n: Decimal) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Number(if b { Decimal::ONE } else { Decimal::ZERO })
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Decimal::from(n))
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> Value {
        Value::Number(Decimal::parse(s).unwrap())
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.as_bool());
        assert!(!Value::from("").as_bool());
        assert!(Value::from("0").as_bool());
        assert!(!num("0").as_bool());
        assert!(num("0.1").as_bool());
    }

    #[test]
    fn test_compare_coerces_strings() {
        assert!(num("10").script_eq(&Value::from("10.0")));
        assert_eq!(Value::from("9").compare(&num("10")), Some(Ordering::Less));
        assert_eq!(Value::from("abc").compare(&num("1")), None);
        assert_eq!(Value::from("9").compare(&Value::from("10")), Some(Ordering::Greater));
        assert!(Value::Null.script_eq(&Value::from("")));
        assert!(!Value::Null.script_eq(&num("0")));
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(Value::Date(date).script_eq(&Value::from("2024-03-01")));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(Value::from("ab").add(&Value::from("cd")).unwrap(), Value::from("abcd"));
        assert_eq!(Value::Null.add(&Value::from("x")).unwrap(), Value::from("x"));
        assert_eq!(num("1.5").add(&Value::from("2")).unwrap(), num("3.5"));
        assert_eq!(Value::Null.sub(&num("2")).unwrap(), num("-2"));
        assert_eq!(num("3").mul(&num("0.5")).unwrap(), num("1.5"));
        assert!(matches!(num("1").div(&num("0")), Err(RuntimeError::Conversion(_))));
        assert!(matches!(Value::from("x").mul(&num("2")), Err(RuntimeError::Conversion(_))));
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(date.add(&num("1")).is_err());
    }

    #[test]
    fn test_display_and_serialize() {
        assert_eq!(num("1234.50").to_string(), "1234.5");
        assert_eq!(Value::Null.to_string(), "");
        let json = serde_json::to_string(&vec![Value::Null, num("2"), Value::from("a")]).unwrap();
        assert_eq!(json, r#"[null,"2","a"]"#);
    }
}
