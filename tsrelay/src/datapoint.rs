//! Data points, tag sets, and values.
//!
//! A [`DataPoint`] is the unit exchanged between measurement producers and the pipeline. Its
//! JSON form is the OpenTSDB `put` object, which is what the pipeline sends over the wire.
use std::{
    collections::{btree_map, BTreeMap},
    fmt,
    time::SystemTime,
};

use serde::{ser::Error as _, Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Errors that could occur while constructing a data point.
#[derive(Debug, Error, PartialEq)]
pub enum DataPointError {
    /// The metric name was empty.
    #[error("metric name must not be empty")]
    EmptyMetric,

    /// The metric name contained a character the ingestion service does not accept.
    #[error("invalid character {ch:?} in metric name '{metric}'")]
    InvalidMetric {
        /// The offending metric name.
        metric: String,
        /// The first invalid character.
        ch: char,
    },

    /// A tag key or value was empty or contained a character the ingestion service does not
    /// accept.
    #[error("invalid tag '{key}={value}' on metric '{metric}'")]
    InvalidTag {
        /// The metric the tag was attached to.
        metric: String,
        /// Tag key.
        key: String,
        /// Tag value.
        value: String,
    },

    /// The value was `NaN` or infinite.
    #[error("non-finite value {value} for metric '{metric}'")]
    NonFiniteValue {
        /// The metric the value was recorded for.
        metric: String,
        /// The rejected value.
        value: f64,
    },
}

fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_char)
}

/// Returns the current time as seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A set of tags attached to a data point.
///
/// Tags are kept ordered by key, so two sets holding the same pairs always render the same
/// canonical string (`{k1=v1,k2=v2}`) regardless of the order they were inserted in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Creates an empty `TagSet`.
    pub fn new() -> Self {
        TagSet(BTreeMap::new())
    }

    /// Inserts a tag, returning the previous value for the key if there was one.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(key.into(), value.into())
    }

    /// Adds a tag, consuming and returning the set.
    #[must_use]
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(key, value);
        self
    }

    /// Gets the value of a tag.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` if the set holds a tag with the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of tags in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set holds no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the tags in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    fn first_invalid(&self) -> Option<(&String, &String)> {
        self.0.iter().find(|(k, v)| !is_valid_name(k) || !is_valid_name(v))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

impl<K, V> FromIterator<(K, V)> for TagSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TagSet(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A numeric measurement.
///
/// Equality is value equality within the same representation: `Integer(1)` and `Float(1.0)` are
/// different values, and a `NaN` float is not equal to anything.
///
/// Serializing a non-finite float fails.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// An integer value.
    Integer(i64),
    /// A floating-point value.
    Float(f64),
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Integer(v) => serializer.serialize_i64(v),
            Value::Float(v) if v.is_finite() => serializer.serialize_f64(v),
            Value::Float(v) => Err(S::Error::custom(format_args!("non-finite value {v}"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or(Value::Float(v as f64), Value::Integer)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// A single measurement: metric name, tags, value, and observation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    metric: String,
    timestamp: i64,
    value: Value,
    tags: TagSet,
}

impl DataPoint {
    /// Creates a `DataPoint`.
    ///
    /// # Errors
    ///
    /// If the metric name is empty, if the metric name or any tag key/value contains a
    /// character outside of `[a-zA-Z0-9-_./]`, or if the value is `NaN` or infinite, an error is
    /// returned.
    pub fn new<M, V>(
        metric: M,
        timestamp: i64,
        value: V,
        tags: TagSet,
    ) -> Result<Self, DataPointError>
    where
        M: Into<String>,
        V: Into<Value>,
    {
        let metric = metric.into();
        if metric.is_empty() {
            return Err(DataPointError::EmptyMetric);
        }
        if let Some(ch) = metric.chars().find(|c| !is_valid_char(*c)) {
            return Err(DataPointError::InvalidMetric { metric, ch });
        }
        if let Some((key, value)) = tags.first_invalid() {
            return Err(DataPointError::InvalidTag {
                key: key.clone(),
                value: value.clone(),
                metric,
            });
        }
        let value = value.into();
        if let Value::Float(value) = value {
            if !value.is_finite() {
                return Err(DataPointError::NonFiniteValue { metric, value });
            }
        }

        Ok(DataPoint { metric, timestamp, value, tags })
    }

    /// Creates a `DataPoint` without validating it.
    #[cfg(test)]
    pub(crate) fn unchecked(metric: &str, timestamp: i64, value: Value) -> Self {
        DataPoint { metric: metric.to_owned(), timestamp, value, tags: TagSet::new() }
    }

    /// Creates a `DataPoint` observed now.
    ///
    /// # Errors
    ///
    /// See [`DataPoint::new`].
    pub fn now<M, V>(metric: M, value: V, tags: TagSet) -> Result<Self, DataPointError>
    where
        M: Into<String>,
        V: Into<Value>,
    {
        Self::new(metric, unix_now(), value, tags)
    }

    /// Metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Observation time, in seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Measured value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Tags.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Copies every tag from `defaults` that this point does not already carry.
    ///
    /// Invalid default tags are skipped, so the point stays valid.
    pub fn add_missing_tags(&mut self, defaults: &TagSet) {
        for (key, value) in defaults.iter() {
            if is_valid_name(key) && is_valid_name(value) && !self.tags.contains_key(key) {
                self.tags.insert(key.clone(), value.clone());
            }
        }
    }

    /// The deduplication key: the metric name followed by the canonical tag string.
    ///
    /// Two points of the same series always share a key, independent of value and timestamp.
    pub fn dedup_key(&self) -> String {
        format!("{}{}", self.metric, self.tags)
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.timestamp, self.value)?;
        for (key, value) in self.tags.iter() {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}
