//! Document identifier.

use crate::error::{CoreError, CoreResult};
use sealdb_codec::{Document, Value};
use std::fmt;
use uuid::Uuid;

/// Name of the identifier field every stored document carries.
pub const ID_FIELD: &str = "_id";

/// Unique identifier of a document within its group.
///
/// Stored in documents as the hyphenated UUID text under `_id`, and in
/// block headers and indexes as the raw 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Creates a new random (UUIDv4) document ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates a document ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the textual UUID form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(|u| Self(u.into_bytes()))
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    /// Returns the `_id` field value for this ID.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }

    /// Reads the `_id` of a stored document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidDocument`] if `_id` is missing or is not
    /// UUID text.
    pub fn of(doc: &Document) -> CoreResult<Self> {
        match doc.get(ID_FIELD) {
            Some(Value::Text(text)) => Self::parse(text)
                .ok_or_else(|| CoreError::invalid_document(format!("_id {text:?} is not a UUID"))),
            Some(other) => Err(CoreError::invalid_document(format!(
                "_id must be text, found {}",
                other.type_name()
            ))),
            None => Err(CoreError::invalid_document("document has no _id")),
        }
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.to_uuid())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid().hyphenated())
    }
}

impl From<Uuid> for DocumentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdb_codec::doc;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(DocumentId::new(), DocumentId::new());
    }

    #[test]
    fn text_form_round_trips() {
        let id = DocumentId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(DocumentId::parse(&text), Some(id));
        assert_eq!(id.to_uuid().get_version_num(), 4);
    }

    #[test]
    fn of_reads_id_field() {
        let id = DocumentId::new();
        let doc = doc! { "_id" => id.to_value(), "name" => "Alice" };
        assert_eq!(DocumentId::of(&doc).unwrap(), id);
    }

    #[test]
    fn of_rejects_bad_ids() {
        assert!(DocumentId::of(&doc! { "name" => "x" }).is_err());
        assert!(DocumentId::of(&doc! { "_id" => 5 }).is_err());
        assert!(DocumentId::of(&doc! { "_id" => "not-a-uuid" }).is_err());
    }

    #[test]
    fn debug_shows_uuid() {
        let id = DocumentId::from_bytes([0u8; 16]);
        assert_eq!(
            format!("{id:?}"),
            "DocumentId(00000000-0000-0000-0000-000000000000)"
        );
    }
}
