//! The structured record: an ordered, heterogeneous tree of atoms and nested
//! lists.  Every source delivers one and the merge engine produces one per
//! tick.

use serde::{Deserialize, Serialize};

/// A single element of a [`Record`].
///
/// JSON form is untagged: integers, floats, strings and arrays map directly
/// onto the matching variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    /// A nested record.
    List(Record),
}

impl Value {
    /// `true` for [`Value::List`].
    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    /// Borrow the nested record, if this value is a list.
    pub fn as_list(&self) -> Option<&Record> {
        match self {
            Value::List(record) => Some(record),
            _ => None,
        }
    }

    /// Borrow the string, if this value is a string atom.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of an `Int` or `Float` atom.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::List(v)
    }
}

/// Ordered sequence of [`Value`]s.  Element order is always preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    items: Vec<Value>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Zero-based element access.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Append one value.
    pub fn push(&mut self, value: impl Into<Value>) {
        self.items.push(value.into());
    }

    /// Append a new empty nested record and return a mutable handle to it.
    pub fn add_list(&mut self) -> &mut Record {
        self.items.push(Value::List(Record::new()));
        match self.items.last_mut() {
            Some(Value::List(record)) => record,
            _ => unreachable!("a list was pushed on the line above"),
        }
    }

    /// Splice every element of `other` onto the end of this record.
    pub fn extend_from(&mut self, other: &Record) {
        self.items.extend(other.items.iter().cloned());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.items
    }
}

impl From<Vec<Value>> for Record {
    fn from(items: Vec<Value>) -> Self {
        Self { items }
    }
}

impl FromIterator<Value> for Record {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Build a [`Record`] from a list of values convertible into [`Value`].
///
/// ```
/// use portmerge_types::{record, Value};
///
/// let r = record![1_i64, 2.5, "x", record![3_i64]];
/// assert_eq!(r.len(), 4);
/// assert!(matches!(r.get(3), Some(Value::List(_))));
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::Record::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::Record::from(vec![$($crate::Value::from($value)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_returns_the_nested_record() {
        let mut r = Record::new();
        r.push(1_i64);
        r.add_list().push("inner");
        assert_eq!(r.len(), 2);
        assert_eq!(r.get(1).and_then(Value::as_list), Some(&record!["inner"]));
    }

    #[test]
    fn extend_from_splices_without_nesting() {
        let mut r = record![1_i64];
        r.extend_from(&record![2_i64, record![3_i64]]);
        assert_eq!(r, record![1_i64, 2_i64, record![3_i64]]);
    }

    #[test]
    fn json_form_is_untagged() {
        let r = record![1_i64, 2.5, "s", record![4_i64]];
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"[1,2.5,"s",[4]]"#);
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn json_integer_stays_integer() {
        let back: Record = serde_json::from_str("[7, 7.0]").unwrap();
        assert_eq!(back.get(0), Some(&Value::Int(7)));
        assert_eq!(back.get(1), Some(&Value::Float(7.0)));
    }
}
