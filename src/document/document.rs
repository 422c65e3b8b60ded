//! Document structure for schema-less indexing.
//!
//! This module provides the [`Document`] structure which represents a single
//! indexable item with dynamically-typed fields. Fields can be added without
//! a predefined schema, which is what allows partial (in-place) updates to
//! carry only the fields they touch.
//!
//! # Examples
//!
//! ```
//! use naginata::document::{Document, FieldValue};
//!
//! let mut doc = Document::new();
//! doc.add_field("title", FieldValue::Text("Rust Book".to_string()));
//! doc.add_field("year", FieldValue::Integer(2024));
//!
//! assert_eq!(doc.len(), 2);
//! assert!(doc.has_field("title"));
//! ```
//!
//! Using the builder pattern:
//!
//! ```
//! use naginata::document::Document;
//!
//! let doc = Document::builder()
//!     .add_text("title", "Rust Programming")
//!     .add_integer("year", 2024)
//!     .add_boolean("available", true)
//!     .build();
//!
//! assert_eq!(doc.field_names().len(), 3);
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::document::field_value::FieldValue;

/// A document is a collection of field-value pairs.
///
/// Field names are case-sensitive; duplicate field names overwrite previous
/// values. A partial document (as written by an in-place update) holds only
/// the touched fields; [`Document::merge_missing_fields`] folds older
/// partials underneath it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The field values for this document
    fields: HashMap<String, FieldValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document {
            fields: HashMap::new(),
        }
    }

    /// Create a builder for fluent document construction.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }

    /// Add or replace a field.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Get a field value by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Check whether the document has a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Remove a field, returning its previous value.
    pub fn remove_field(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// All field names, in no particular order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(|k| k.as_str()).collect()
    }

    /// The underlying field map.
    pub fn fields(&self) -> &HashMap<String, FieldValue> {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Add all fields from `older` that are not already present in `self`.
    ///
    /// When `only_fields` is given, only those field names are considered.
    /// This is the merge step of partial-update resolution: newer values win,
    /// older partials fill in the gaps.
    pub fn merge_missing_fields(&mut self, older: &Document, only_fields: Option<&HashSet<String>>) {
        for (name, value) in &older.fields {
            if self.fields.contains_key(name) {
                continue;
            }
            if let Some(only) = only_fields {
                if !only.contains(name) {
                    continue;
                }
            }
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Whether every name in `fields` is present in this document.
    pub fn contains_all(&self, fields: &HashSet<String>) -> bool {
        fields.iter().all(|f| self.fields.contains_key(f))
    }
}

/// Fluent builder for [`Document`].
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    doc: Document,
}

impl DocumentBuilder {
    /// Create a new empty builder.
    pub fn new() -> Self {
        DocumentBuilder {
            doc: Document::new(),
        }
    }

    /// Add a text field.
    pub fn add_text<S: Into<String>, V: Into<String>>(mut self, name: S, value: V) -> Self {
        self.doc.add_field(name, FieldValue::Text(value.into()));
        self
    }

    /// Add an integer field.
    pub fn add_integer<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.doc.add_field(name, FieldValue::Integer(value));
        self
    }

    /// Add a float field.
    pub fn add_float<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.doc.add_field(name, FieldValue::Float(value));
        self
    }

    /// Add a boolean field.
    pub fn add_boolean<S: Into<String>>(mut self, name: S, value: bool) -> Self {
        self.doc.add_field(name, FieldValue::Boolean(value));
        self
    }

    /// Add a binary field.
    pub fn add_binary<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.doc.add_field(name, FieldValue::Binary(value));
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_basic_operations() {
        let mut doc = Document::new();
        assert!(doc.is_empty());

        doc.add_field("title", FieldValue::Text("hello".into()));
        doc.add_field("count", FieldValue::Integer(3));

        assert_eq!(doc.len(), 2);
        assert!(doc.has_field("title"));
        assert_eq!(doc.get_field("title").unwrap().as_text(), Some("hello"));

        doc.remove_field("count");
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_builder() {
        let doc = Document::builder()
            .add_text("title", "x")
            .add_integer("year", 2024)
            .add_float("rating", 4.5)
            .add_boolean("available", true)
            .build();

        assert_eq!(doc.len(), 4);
        assert_eq!(doc.get_field("year").unwrap().as_integer(), Some(2024));
    }

    #[test]
    fn test_merge_missing_fields() {
        let mut newer = Document::builder().add_integer("y", 2).build();
        let older = Document::builder()
            .add_integer("x", 1)
            .add_integer("y", 1)
            .build();

        newer.merge_missing_fields(&older, None);

        // newer value wins, missing field filled in
        assert_eq!(newer.get_field("y").unwrap().as_integer(), Some(2));
        assert_eq!(newer.get_field("x").unwrap().as_integer(), Some(1));
    }

    #[test]
    fn test_merge_restricted_to_fields() {
        let mut newer = Document::new();
        let older = Document::builder()
            .add_integer("x", 1)
            .add_integer("y", 1)
            .build();

        let only: HashSet<String> = ["x".to_string()].into_iter().collect();
        newer.merge_missing_fields(&older, Some(&only));

        assert!(newer.has_field("x"));
        assert!(!newer.has_field("y"));
        assert!(newer.contains_all(&only));
    }

    #[test]
    fn test_serde_round_trip() {
        let doc = Document::builder()
            .add_text("id", "a")
            .add_integer("v", 10)
            .build();

        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }
}
