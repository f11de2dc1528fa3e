//! Row keys and read ranges
//!
//! Keys compare lexicographically by component; a proper prefix sorts before
//! any of its extensions, so the empty key is the global minimum and
//! [`Key::max`] (a single `Max` sentinel) is the global maximum.

use serde::{Deserialize, Serialize};

/// One key component
///
/// Variant order defines cross-type ordering: `Min` sentinel first, `Max` last.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    Min,
    Null,
    Boolean(bool),
    Int64(i64),
    Uint64(u64),
    String(String),
    Max,
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::Min => write!(f, "<min>"),
            KeyValue::Null => write!(f, "#"),
            KeyValue::Boolean(v) => write!(f, "%{}", v),
            KeyValue::Int64(v) => write!(f, "{}", v),
            KeyValue::Uint64(v) => write!(f, "{}u", v),
            KeyValue::String(v) => write!(f, "{:?}", v),
            KeyValue::Max => write!(f, "<max>"),
        }
    }
}

/// Owning row key
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub Vec<KeyValue>);

impl Key {
    /// The minimum key (no components)
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// The maximum key
    pub fn max() -> Self {
        Self(vec![KeyValue::Max])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_max(&self) -> bool {
        self.0.first() == Some(&KeyValue::Max)
    }

    /// Smallest key strictly greater than `self`
    pub fn successor(&self) -> Self {
        let mut values = self.0.clone();
        values.push(KeyValue::Min);
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is usable as a pivot for a table with `key_column_count` key columns
    pub fn validate_pivot(&self, key_column_count: usize) -> Result<(), String> {
        if self.0.len() > key_column_count {
            return Err(format!(
                "Pivot key {} has {} components, table has only {} key columns",
                self,
                self.0.len(),
                key_column_count
            ));
        }
        if let Some(value) = self
            .0
            .iter()
            .find(|v| matches!(v, KeyValue::Min | KeyValue::Max))
        {
            return Err(format!("Pivot key {} contains sentinel value {}", self, value));
        }
        Ok(())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(vec![KeyValue::String(value.to_string())])
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self(vec![KeyValue::Int64(value)])
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}

/// Key range restriction `[lower, upper)`; missing limits are unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
}

impl ReadRange {
    pub fn new(lower: Option<Key>, upper: Option<Key>) -> Self {
        Self { lower, upper }
    }

    /// Bounded range; limits equal to the global min/max are dropped
    pub fn between(lower: Key, upper: Key) -> Self {
        Self {
            lower: if lower.is_empty() { None } else { Some(lower) },
            upper: if upper.is_max() { None } else { Some(upper) },
        }
    }

    pub fn lower_key(&self) -> Key {
        self.lower.clone().unwrap_or_default()
    }

    pub fn upper_key(&self) -> Key {
        self.upper.clone().unwrap_or_else(Key::max)
    }

    /// Intersection with another range
    pub fn intersect(&self, other: &ReadRange) -> ReadRange {
        let lower = std::cmp::max(self.lower_key(), other.lower_key());
        let upper = std::cmp::min(self.upper_key(), other.upper_key());
        ReadRange::between(lower, upper)
    }

    pub fn is_empty(&self) -> bool {
        self.lower_key() >= self.upper_key()
    }
}

impl std::fmt::Display for ReadRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.lower_key(), self.upper_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = Key::from("a");
        let b = Key::from("b");
        assert!(Key::empty() < a);
        assert!(a < a.successor());
        assert!(a.successor() < b);
        assert!(b < Key::max());
        assert!(Key::from(100) < Key::from("a"));
    }

    #[test]
    fn test_read_range_intersection() {
        let range = ReadRange::between(Key::from("c"), Key::from("k"));
        let clipped = range.intersect(&ReadRange::between(Key::from("f"), Key::max()));
        assert_eq!(clipped.lower_key(), Key::from("f"));
        assert_eq!(clipped.upper_key(), Key::from("k"));
        assert!(!clipped.is_empty());

        let disjoint = range.intersect(&ReadRange::between(Key::from("x"), Key::max()));
        assert!(disjoint.is_empty());
    }

    #[test]
    fn test_pivot_validation() {
        assert!(Key::from("a").validate_pivot(1).is_ok());
        assert!(Key(vec![KeyValue::Int64(1), KeyValue::Int64(2)])
            .validate_pivot(1)
            .is_err());
        assert!(Key::max().validate_pivot(2).is_err());
    }
}
