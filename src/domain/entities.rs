//! Harvested record shapes
//!
//! Site adapters translate raw payloads into these field bundles; only the
//! upsert store turns them into persisted rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque attribute bag carried by every record (ratings, addresses, tags...)
pub type Fields = Map<String, Value>;

/// Persisted record families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Listing,
    Comment,
    Qa,
}

impl RecordKind {
    pub const fn table(self) -> &'static str {
        match self {
            Self::Listing => "listings",
            Self::Comment => "comments",
            Self::Qa => "qa_entries",
        }
    }

    /// Comments and Q&A rows are owned by a listing
    pub const fn requires_parent(self) -> bool {
        !matches!(self, Self::Listing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listing => "listing",
            Self::Comment => "comment",
            Self::Qa => "qa",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A city or region walked by one collection run.
///
/// `params` carries the site-specific coordinates of the collection
/// (province/city ids, url slugs) that only the adapter understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionKey {
    pub key: String,
    #[serde(default)]
    pub params: Fields,
}

impl CollectionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: Fields::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Listing fields as parsed from a list entry (and later merged with detail data)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingFields {
    pub natural_id: String,
    pub name: String,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default)]
    pub enrichment_text: String,
}

impl ListingFields {
    pub fn new(natural_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            natural_id: natural_id.into(),
            name: name.into(),
            fields: Fields::new(),
            enrichment_text: String::new(),
        }
    }

    /// Supplied keys win over existing ones
    pub fn merge(&mut self, extra: Fields) {
        for (key, value) in extra {
            self.fields.insert(key, value);
        }
    }

    pub fn to_record(&self) -> Fields {
        let mut record = self.fields.clone();
        record.insert("name".into(), Value::String(self.name.clone()));
        record.insert(
            "enrichment_text".into(),
            Value::String(self.enrichment_text.clone()),
        );
        record
    }
}

/// A single review as parsed from a comment page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentFields {
    pub natural_id: String,
    pub content: String,
    pub rating: f64,
    #[serde(default)]
    pub fields: Fields,
}

impl CommentFields {
    pub fn new(natural_id: impl Into<String>, content: impl Into<String>, rating: f64) -> Self {
        Self {
            natural_id: natural_id.into(),
            content: content.into(),
            rating,
            fields: Fields::new(),
        }
    }

    /// Non-empty content, a non-zero rating and more than `min_content_bytes` of UTF-8 text.
    pub fn is_acceptable(&self, min_content_bytes: usize) -> bool {
        !self.natural_id.is_empty()
            && !self.content.trim().is_empty()
            && self.rating != 0.0
            && self.content.len() > min_content_bytes
    }

    pub fn to_record(&self) -> Fields {
        let mut record = self.fields.clone();
        record.insert("content".into(), Value::String(self.content.clone()));
        record.insert("rating".into(), Value::from(self.rating));
        record
    }
}

/// One Q&A row. A question with several answers is represented by several
/// rows whose ids share the question id as prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaFields {
    pub natural_id: String,
    pub question: String,
    #[serde(default)]
    pub fields: Fields,
}

impl QaFields {
    pub fn new(natural_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            natural_id: natural_id.into(),
            question: question.into(),
            fields: Fields::new(),
        }
    }

    pub fn is_acceptable(&self) -> bool {
        !self.natural_id.trim().is_empty() && !self.question.trim().is_empty()
    }

    pub fn to_record(&self) -> Fields {
        let mut record = self.fields.clone();
        record.insert("question".into(), Value::String(self.question.clone()));
        record
    }
}

/// A row as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub kind: RecordKind,
    pub natural_id: String,
    pub parent_id: Option<String>,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
