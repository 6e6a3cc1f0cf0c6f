//! The tagged value type every event carries, and the set of admissible
//! value tags an item may declare.

use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

use crate::unit::Unit;

pub type Number = f64;

/// Discriminant for [`Value`], also used standalone to describe which
/// kinds of value an item accepts (`Item::value_types`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Void,
    String,
    Boolean,
    Number,
    TimePoint,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Undefined => "UNDEFINED",
            ValueType::Void => "VOID",
            ValueType::String => "STRING",
            ValueType::Boolean => "BOOLEAN",
            ValueType::Number => "NUMBER",
            ValueType::TimePoint => "TIME_POINT",
        }
    }

    pub fn parse(s: &str) -> Option<ValueType> {
        match s {
            "UNDEFINED" => Some(ValueType::Undefined),
            "VOID" => Some(ValueType::Void),
            "STRING" => Some(ValueType::String),
            "BOOLEAN" => Some(ValueType::Boolean),
            "NUMBER" => Some(ValueType::Number),
            "TIME_POINT" => Some(ValueType::TimePoint),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-empty set of admissible [`ValueType`]s, as declared on an item's
/// `type` configuration field (`"BOOLEAN|NUMBER"`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueTypes(HashSet<ValueType>);

impl ValueTypes {
    pub fn parse(spec: &str) -> Result<ValueTypes, String> {
        let mut set = HashSet::new();
        for part in spec.split('|') {
            let part = part.trim();
            let vt = ValueType::parse(part).ok_or_else(|| format!("unknown value type '{part}'"))?;
            set.insert(vt);
        }
        if set.is_empty() {
            return Err("value type list must not be empty".into());
        }
        Ok(ValueTypes(set))
    }

    pub fn contains(&self, vt: ValueType) -> bool {
        self.0.contains(&vt)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueType> {
        self.0.iter()
    }
}

impl fmt::Display for ValueTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = self.0.iter().map(|vt| vt.as_str()).collect();
        parts.sort_unstable();
        write!(f, "{}", parts.join("|"))
    }
}

/// A point in wall-clock time, stored as seconds since the Unix epoch.
///
/// `f64`-free on purpose: send-suppression math never needs it, and a plain
/// integer keeps the handler-facing string conversions (`timePointFormat`)
/// unambiguous.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimePoint(pub i64);

impl TimePoint {
    pub fn now() -> TimePoint {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        TimePoint(secs as i64)
    }

    pub fn epoch_secs(self) -> i64 {
        self.0
    }
}

/// Tagged union over exactly one inhabited arm, plus a distinguished NULL
/// (uninitialised) state observable via [`Value::is_null`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Undefined,
    Void,
    String(String),
    Boolean(bool),
    Number(Number, Unit),
    TimePoint(TimePoint),
}

impl Value {
    pub fn new_undefined() -> Value {
        Value::Undefined
    }

    pub fn new_void() -> Value {
        Value::Void
    }

    pub fn new_string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn new_boolean(b: bool) -> Value {
        Value::Boolean(b)
    }

    pub fn new_number(n: Number) -> Value {
        Value::Number(n, Unit::Unknown)
    }

    pub fn new_number_with_unit(n: Number, unit: Unit) -> Value {
        Value::Number(n, unit)
    }

    pub fn new_time_point(t: TimePoint) -> Value {
        Value::TimePoint(t)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_, _))
    }

    pub fn is_time_point(&self) -> bool {
        matches!(self, Value::TimePoint(_))
    }

    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Undefined => Some(ValueType::Undefined),
            Value::Void => Some(ValueType::Void),
            Value::String(_) => Some(ValueType::String),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Number(_, _) => Some(ValueType::Number),
            Value::TimePoint(_) => Some(ValueType::TimePoint),
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n, _) => Some(*n),
            _ => None,
        }
    }

    pub fn as_number_in(&self, target: Unit) -> Option<Number> {
        match self {
            Value::Number(n, unit) => unit.convert_to(*n, target),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<Unit> {
        match self {
            Value::Number(_, unit) => Some(*unit),
            _ => None,
        }
    }

    pub fn as_time_point(&self) -> Option<TimePoint> {
        match self {
            Value::TimePoint(t) => Some(*t),
            _ => None,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "<null>".into(),
            Value::Undefined => "<undefined>".into(),
            Value::Void => "<void>".into(),
            Value::String(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n, unit) => unit.format(*n),
            Value::TimePoint(t) => t.epoch_secs().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_distinct_from_undefined() {
        assert!(Value::Null.is_null());
        assert!(!Value::Undefined.is_null());
        assert_ne!(Value::Null, Value::Undefined);
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(
            Value::new_number_with_unit(1.0, Unit::Watt),
            Value::new_number_with_unit(1.0, Unit::Watt)
        );
        assert_ne!(
            Value::new_number_with_unit(1.0, Unit::Watt),
            Value::new_number_with_unit(1.0, Unit::WattHour)
        );
    }

    #[test]
    fn value_types_parses_pipe_list() {
        let types = ValueTypes::parse("BOOLEAN|NUMBER").unwrap();
        assert!(types.contains(ValueType::Boolean));
        assert!(types.contains(ValueType::Number));
        assert!(!types.contains(ValueType::String));
    }

    #[test]
    fn value_types_rejects_empty() {
        assert!(ValueTypes::parse("").is_err());
    }
}
