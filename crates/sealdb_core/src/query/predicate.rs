//! Query predicates.

use sealdb_codec::{Document, Value};
use std::cmp::Ordering;

/// A condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field is present and structurally equal to the value.
    Eq(Value),
    /// Field is missing or differs from the value.
    Ne(Value),
    /// Field is greater than the value.
    Gt(Value),
    /// Field is greater than or equal to the value.
    Gte(Value),
    /// Field is less than the value.
    Lt(Value),
    /// Field is less than or equal to the value.
    Lte(Value),
    /// Field presence (`true`) or absence (`false`).
    Exists(bool),
}

/// A condition applied to a dotted field path.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Dotted path such as `address.city`.
    pub path: String,
    /// What the field must satisfy.
    pub condition: Condition,
}

impl Clause {
    /// Evaluates the clause against `doc`.
    ///
    /// Range conditions between values of different types, or against a
    /// NaN, are false.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        let field = doc.get_path(&self.path);
        let ordered = |want: fn(Ordering) -> bool, value: &Value| {
            field
                .and_then(|f| f.partial_compare(value))
                .is_some_and(want)
        };
        match &self.condition {
            Condition::Eq(value) => field == Some(value),
            Condition::Ne(value) => field != Some(value),
            Condition::Gt(value) => ordered(Ordering::is_gt, value),
            Condition::Gte(value) => ordered(Ordering::is_ge, value),
            Condition::Lt(value) => ordered(Ordering::is_lt, value),
            Condition::Lte(value) => ordered(Ordering::is_le, value),
            Condition::Exists(present) => field.is_some() == *present,
        }
    }
}

/// A conjunction of clauses. The empty query matches every document.
///
/// ```rust,ignore
/// let adults = Query::new().eq("role", "admin").gte("age", 18);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// Creates a query matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Alias of [`Query::new`] for readability at call sites.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn with(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push(Clause {
            path: path.into(),
            condition,
        });
        self
    }

    /// Adds `path == value`.
    #[must_use]
    pub fn eq(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Eq(value.into()))
    }

    /// Adds `path != value`.
    #[must_use]
    pub fn ne(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Ne(value.into()))
    }

    /// Adds `path > value`.
    #[must_use]
    pub fn gt(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Gt(value.into()))
    }

    /// Adds `path >= value`.
    #[must_use]
    pub fn gte(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Gte(value.into()))
    }

    /// Adds `path < value`.
    #[must_use]
    pub fn lt(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Lt(value.into()))
    }

    /// Adds `path <= value`.
    #[must_use]
    pub fn lte(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Lte(value.into()))
    }

    /// Adds a presence check.
    #[must_use]
    pub fn exists(self, path: impl Into<String>, present: bool) -> Self {
        self.with(path, Condition::Exists(present))
    }

    /// The clauses, in the order they were added.
    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Returns `true` if the query has no clauses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluates every clause against `doc`.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|c| c.matches(doc))
    }
}

/// Builds equality clauses from a sample document, so
/// `doc! { "role" => "admin" }` finds every admin.
impl From<Document> for Query {
    fn from(sample: Document) -> Self {
        sample
            .into_iter()
            .fold(Self::new(), |query, (field, value)| query.eq(field, value))
    }
}

impl From<&Query> for Query {
    fn from(query: &Query) -> Self {
        query.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdb_codec::doc;

    fn alice() -> Document {
        doc! {
            "name" => "Alice",
            "age" => 34,
            "address" => doc! { "city" => "Oslo" },
            "tags" => vec![Value::from("a"), Value::from("b")],
        }
    }

    #[test]
    fn equality_is_structural() {
        assert!(Query::new().eq("name", "Alice").matches(&alice()));
        assert!(Query::new().eq("address", doc! { "city" => "Oslo" }).matches(&alice()));
        assert!(Query::new()
            .eq("tags", vec![Value::from("a"), Value::from("b")])
            .matches(&alice()));
        assert!(!Query::new().eq("age", 34.0).matches(&alice()));
        assert!(!Query::new().eq("missing", Value::Null).matches(&alice()));
    }

    #[test]
    fn nested_paths() {
        assert!(Query::new().eq("address.city", "Oslo").matches(&alice()));
        assert!(!Query::new().eq("address.zip", "0150").matches(&alice()));
    }

    #[test]
    fn ranges() {
        let doc = alice();
        assert!(Query::new().gt("age", 30).lt("age", 40).matches(&doc));
        assert!(Query::new().gte("age", 34).lte("age", 34).matches(&doc));
        assert!(!Query::new().gt("age", 34).matches(&doc));
        assert!(Query::new().gt("name", "Aaron").matches(&doc));
    }

    #[test]
    fn range_across_types_is_false() {
        let doc = alice();
        assert!(!Query::new().gt("age", "10").matches(&doc));
        assert!(!Query::new().lt("age", "10").matches(&doc));
        assert!(!Query::new().gt("missing", 0).matches(&doc));
    }

    #[test]
    fn ne_and_exists() {
        let doc = alice();
        assert!(Query::new().ne("name", "Bob").matches(&doc));
        assert!(Query::new().ne("missing", "x").matches(&doc));
        assert!(!Query::new().ne("name", "Alice").matches(&doc));
        assert!(Query::new().exists("address.city", true).matches(&doc));
        assert!(Query::new().exists("email", false).matches(&doc));
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(Query::all().matches(&Document::new()));
        assert!(Query::all().is_empty());
    }

    #[test]
    fn from_sample_document() {
        let query = Query::from(doc! { "role" => "admin", "active" => true });
        assert_eq!(query.clauses().len(), 2);
        assert!(query.matches(&doc! { "name" => "x", "role" => "admin", "active" => true }));
        assert!(!query.matches(&doc! { "role" => "admin" }));
    }
}
