//! Document module for schema-less indexing.
//!
//! Provides the document structure and field value types shared by the
//! update log and the index boundary.

#[allow(clippy::module_inception)]
pub mod document;
pub mod field_value;

pub use document::{Document, DocumentBuilder};
pub use field_value::FieldValue;
