// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Parameter and result values, and the constraints capabilities place on
//! them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// The separator between the two ends of a range or temporal scope.
pub(crate) const RANGE_SEPARATOR: &str = " ... ";

/// A concrete parameter or result value.
///
/// Numeric values compare by magnitude regardless of their representation, so
/// `Natural(1)`, `Integer(1)` and `Real(1.0)` are all equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A non-negative integer.
    Natural(u64),
    /// A signed integer.
    Integer(i64),
    /// A finite floating point number.
    Real(f64),
    /// Anything else, e.g. an address or a name.
    Text(String),
}

impl Value {
    /// Interprets `s` as the most specific value it spells.
    ///
    /// Never fails: text that is not a boolean or a finite number is
    /// [`Value::Text`].
    pub fn parse(s: &str) -> Value {
        let s = s.trim();
        match s {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(n) = s.parse::<u64>() {
            Value::Natural(n)
        } else if let Ok(i) = s.parse::<i64>() {
            Value::Integer(i)
        } else if let Some(f) = s.parse::<f64>().ok().filter(|f| f.is_finite()) {
            Value::Real(f)
        } else {
            Value::Text(s.to_owned())
        }
    }

    /// Returns this value as a float, if it is numeric.
    #[allow(clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Natural(n) => Some(*n as f64),
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            Value::Bool(_) | Value::Text(_) => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Natural(n) => Some(i128::from(*n)),
            Value::Integer(i) => Some(i128::from(*i)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => (a == b).then_some(Ordering::Equal),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Natural(n) => write!(f, "{n}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Value {
        Value::Natural(n)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Real(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}

/// The set of values a capability accepts for one parameter.
///
/// The textual form is `*` for any value, `a,b,c` for an enumerated set,
/// `lo ... hi` for an inclusive range, and the bare value otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Constraint {
    /// Any value is accepted.
    Any,
    /// Only this value is accepted.
    Exact(Value),
    /// Any of these values is accepted.
    OneOf(Vec<Value>),
    /// Any value between `lo` and `hi`, inclusive.
    Range {
        /// The smallest accepted value.
        lo: Value,
        /// The largest accepted value.
        hi: Value,
    },
}

impl Constraint {
    /// Reports whether `value` satisfies this constraint.
    pub fn contains(&self, value: &Value) -> bool {
        match self {
            Constraint::Any => true,
            Constraint::Exact(v) => v == value,
            Constraint::OneOf(vs) => vs.iter().any(|v| v == value),
            Constraint::Range { lo, hi } => lo <= value && value <= hi,
        }
    }

    /// Returns the only value this constraint accepts, if there is exactly
    /// one.
    pub fn single_value(&self) -> Option<&Value> {
        match self {
            Constraint::Exact(v) => Some(v),
            Constraint::OneOf(vs) => match vs.as_slice() {
                [v] => Some(v),
                _ => None,
            },
            Constraint::Range { lo, hi } if lo == hi => Some(lo),
            Constraint::Any | Constraint::Range { .. } => None,
        }
    }

    /// Reports whether every value `other` accepts is also accepted by
    /// `self`.
    ///
    /// Ranges are not enumerable, so a range is only contained in an
    /// enumerated set when it spans a single value.
    pub fn is_superset_of(&self, other: &Constraint) -> bool {
        match (self, other) {
            (Constraint::Any, _) => true,
            (_, Constraint::Any) => false,
            (_, Constraint::Exact(v)) => self.contains(v),
            (_, Constraint::OneOf(vs)) => vs.iter().all(|v| self.contains(v)),
            (Constraint::Range { .. }, Constraint::Range { lo, hi }) => {
                self.contains(lo) && self.contains(hi)
            }
            (_, Constraint::Range { lo, hi }) => lo == hi && self.contains(lo),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Any => f.write_str("*"),
            Constraint::Exact(v) => write!(f, "{v}"),
            Constraint::OneOf(vs) => write!(f, "{}", vs.iter().join(",")),
            Constraint::Range { lo, hi } => write!(f, "{lo}{RANGE_SEPARATOR}{hi}"),
        }
    }
}

impl FromStr for Constraint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Constraint, ParseError> {
        let s = s.trim();
        let err = |reason: &str| ParseError::Constraint {
            input: s.to_owned(),
            reason: reason.to_owned(),
        };
        if s.is_empty() {
            return Err(err("empty constraint"));
        }
        if s == "*" {
            return Ok(Constraint::Any);
        }
        if let Some((lo, hi)) = s.split_once(RANGE_SEPARATOR.trim()) {
            let (lo, hi) = (Value::parse(lo), Value::parse(hi));
            return match lo.partial_cmp(&hi) {
                Some(Ordering::Less | Ordering::Equal) => Ok(Constraint::Range { lo, hi }),
                Some(Ordering::Greater) => Err(err("range lower bound exceeds upper bound")),
                None => Err(err("range bounds are not comparable")),
            };
        }
        if s.contains(',') {
            let values: Vec<_> = s.split(',').map(Value::parse).collect();
            if values.iter().any(|v| matches!(v, Value::Text(t) if t.is_empty())) {
                return Err(err("empty set member"));
            }
            return Ok(Constraint::OneOf(values));
        }
        Ok(Constraint::Exact(Value::parse(s)))
    }
}

impl From<Constraint> for String {
    fn from(c: Constraint) -> String {
        c.to_string()
    }
}

impl TryFrom<String> for Constraint {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Constraint, ParseError> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn value_parse() {
        assert_eq!(Value::parse("true"), Value::Bool(true));
        assert!(matches!(Value::parse("42"), Value::Natural(42)));
        assert!(matches!(Value::parse("-3"), Value::Integer(-3)));
        assert!(matches!(Value::parse("2.5"), Value::Real(_)));
        assert!(matches!(Value::parse("NaN"), Value::Text(_)));
        assert!(matches!(Value::parse("10.0.0.1"), Value::Text(_)));
    }

    #[test]
    fn numeric_values_compare_by_magnitude() {
        assert_eq!(Value::Natural(1), Value::Integer(1));
        assert_eq!(Value::Natural(1), Value::Real(1.0));
        assert!(Value::Integer(-1) < Value::Natural(0));
        assert_ne!(Value::Text("1".into()), Value::Natural(1));
        assert_eq!(Value::Bool(true).partial_cmp(&Value::Bool(false)), None);
    }

    #[test]
    fn constraint_text_forms() {
        assert_eq!("*".parse::<Constraint>().unwrap(), Constraint::Any);
        assert_eq!(
            "1 ... 10".parse::<Constraint>().unwrap(),
            Constraint::Range {
                lo: Value::Natural(1),
                hi: Value::Natural(10)
            }
        );
        assert_eq!(
            "a,b".parse::<Constraint>().unwrap(),
            Constraint::OneOf(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            "10.0.0.1".parse::<Constraint>().unwrap(),
            Constraint::Exact("10.0.0.1".into())
        );
        assert!("10 ... 1".parse::<Constraint>().is_err());
        assert!("a,,b".parse::<Constraint>().is_err());
        assert!("".parse::<Constraint>().is_err());

        for text in ["*", "1 ... 10", "a,b,c", "x"] {
            let c: Constraint = text.parse().unwrap();
            assert_eq!(c.to_string(), text);
        }
    }

    #[test]
    fn constraint_contains() {
        let range: Constraint = "1 ... 10".parse().unwrap();
        assert!(range.contains(&Value::Natural(1)));
        assert!(range.contains(&Value::Real(9.5)));
        assert!(!range.contains(&Value::Natural(11)));
        assert!(!range.contains(&Value::Text("5".into())));

        let set: Constraint = "a,b".parse().unwrap();
        assert!(set.contains(&"b".into()));
        assert!(!set.contains(&"c".into()));

        assert!(Constraint::Any.contains(&Value::Bool(false)));
        assert_eq!(
            Constraint::OneOf(vec![Value::Natural(3)]).single_value(),
            Some(&Value::Natural(3))
        );
        assert_eq!(range.single_value(), None);
    }

    #[test]
    fn constraint_superset() {
        let wide: Constraint = "0 ... 100".parse().unwrap();
        let narrow: Constraint = "10 ... 20".parse().unwrap();
        let set: Constraint = "10,20".parse().unwrap();
        assert!(Constraint::Any.is_superset_of(&wide));
        assert!(!wide.is_superset_of(&Constraint::Any));
        assert!(wide.is_superset_of(&narrow));
        assert!(!narrow.is_superset_of(&wide));
        assert!(narrow.is_superset_of(&set));
        assert!(!set.is_superset_of(&narrow));
        assert!(set.is_superset_of(&Constraint::Exact(Value::Natural(20))));
    }

    fn constraint_strategy() -> impl Strategy<Value = Constraint> {
        prop_oneof![
            Just(Constraint::Any),
            (0u64..50).prop_map(|v| Constraint::Exact(Value::Natural(v))),
            proptest::collection::vec(0u64..50, 1..5)
                .prop_map(|vs| Constraint::OneOf(vs.into_iter().map(Value::Natural).collect())),
            (0u64..50, 0u64..50).prop_map(|(a, b)| Constraint::Range {
                lo: Value::Natural(a.min(b)),
                hi: Value::Natural(a.max(b)),
            }),
        ]
    }

    proptest! {
        #[test]
        fn superset_is_sound(a in constraint_strategy(), b in constraint_strategy(), v in 0u64..50) {
            let v = Value::Natural(v);
            if a.is_superset_of(&b) && b.contains(&v) {
                prop_assert!(a.contains(&v));
            }
        }

        #[test]
        fn superset_is_reflexive(a in constraint_strategy()) {
            prop_assert!(a.is_superset_of(&a));
        }
    }
}
