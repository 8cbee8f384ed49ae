use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const USER_ID: &str = "user_id";
pub const PROJECT_ID: &str = "project_id";

/// Metadata keys a filter may constrain. Anything else is free-form payload.
pub const FILTER_KEYS: &[&str] = &[
    USER_ID,
    PROJECT_ID,
    "submission_id",
    "filename",
    "language",
    "severity",
    "function",
    "kind",
    "review_type",
    "interaction_type",
];

/// The five logical collections of a deployment, in purge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    CodeSubmissions,
    SecurityReviews,
    LogicReviews,
    UserContext,
    ProjectContext,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 5] = [
        CollectionKind::CodeSubmissions,
        CollectionKind::SecurityReviews,
        CollectionKind::LogicReviews,
        CollectionKind::UserContext,
        CollectionKind::ProjectContext,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CollectionKind::CodeSubmissions => "code_submissions",
            CollectionKind::SecurityReviews => "security_reviews",
            CollectionKind::LogicReviews => "logic_reviews",
            CollectionKind::UserContext => "user_context",
            CollectionKind::ProjectContext => "project_context",
        }
    }

    pub(crate) fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for CollectionKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnknownCollection(s.to_string()))
    }
}

/// Scalar metadata value.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Str(s) => f.write_str(s),
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Int(n) => write!(f, "{n}"),
            MetaValue::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<&String> for MetaValue {
    fn from(s: &String) -> Self {
        MetaValue::Str(s.clone())
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Int(n)
    }
}

impl From<u32> for MetaValue {
    fn from(n: u32) -> Self {
        MetaValue::Int(i64::from(n))
    }
}

impl From<usize> for MetaValue {
    fn from(n: usize) -> Self {
        MetaValue::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetaValue {
    fn from(x: f64) -> Self {
        MetaValue::Float(x)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct MetaField {
    pub key: String,
    pub value: MetaValue,
}

/// Metadata map kept sorted by key so it archives as a flat vector.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Default)]
#[archive(check_bytes)]
pub struct Metadata(Vec<MetaField>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<MetaValue>) {
        let value = value.into();
        match self.0.binary_search_by(|f| f.key.as_str().cmp(key)) {
            Ok(pos) => self.0[pos].value = value,
            Err(pos) => self.0.insert(
                pos,
                MetaField {
                    key: key.to_string(),
                    value,
                },
            ),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0
            .binary_search_by(|f| f.key.as_str().cmp(key))
            .ok()
            .map(|pos| &self.0[pos].value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get_str(USER_ID).filter(|u| !u.is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.0.iter().map(|f| (f.key.as_str(), &f.value))
    }

    /// Adds every entry of `other` that is not already present.
    pub fn merge_missing(&mut self, other: &Metadata) {
        for (key, value) in other.iter() {
            if self.get(key).is_none() {
                self.insert(key, value.clone());
            }
        }
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for field in &self.0 {
            map.serialize_entry(&field.key, &field.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <BTreeMap<String, MetaValue> as Deserialize<'de>>::deserialize(deserializer)?;
        Ok(raw.into_iter().fold(Metadata::new(), |mut meta, (k, v)| {
            meta.insert(&k, v);
            meta
        }))
    }
}

/// One stored item of a collection.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Record {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: String,
    pub metadata: Metadata,
}

/// A record as handed back to callers, without its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
}

impl From<Record> for StoredDocument {
    fn from(record: Record) -> Self {
        Self {
            id: record.id,
            document: record.document,
            metadata: record.metadata,
        }
    }
}

/// Conjunctive exact-match filter over metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    clauses: Vec<(String, MetaValue)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(user_id: &str) -> Self {
        Self::new().and(USER_ID, user_id)
    }

    pub fn and(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.clauses.push((key.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, meta: &Metadata) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| meta.get(key) == Some(value))
    }

    /// The `user_id` this filter pins, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.clauses
            .iter()
            .find(|(key, _)| key == USER_ID)
            .and_then(|(_, v)| v.as_str())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self
            .clauses
            .iter()
            .find(|(key, _)| !FILTER_KEYS.contains(&key.as_str()))
        {
            Some((key, _)) => Err(ValidationError::UnknownFilterKey(key.clone())),
            None => Ok(()),
        }
    }
}

/// The `(user_id, project_id?)` pair that bounds a retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl Scope {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: None,
        }
    }

    pub fn project(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: Some(project_id.into()),
        }
    }

    pub fn to_filter(&self) -> Result<Filter, ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField(USER_ID));
        }
        let mut filter = Filter::user(&self.user_id);
        if let Some(project_id) = self.project_id.as_deref().filter(|p| !p.is_empty()) {
            filter = filter.and(PROJECT_ID, project_id);
        }
        Ok(filter)
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
