//! # Index Engine Contract
//!
//! The boolean-expression index is an external collaborator. The control
//! plane only needs to create empty indexes and insert documents into them;
//! the query side is used by the request-serving path.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::inventory::CanonicalOffer;

/// Document id, `<channel>_<offer id>`.
pub type DocId = String;

/// Request attributes matched against targeting expressions, e.g.
/// `country => "US"`, `os => "android"`.
pub type Conditions = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("invalid expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("document {0} is already indexed")]
    DuplicateDocument(DocId),

    #[error("document {0} not found")]
    NotFound(DocId),

    #[error("invalid condition {field:?}: {reason}")]
    InvalidCondition { field: String, reason: &'static str },
}

/// One index instance. Built by a single writer, then shared read-only.
pub trait SearchIndex: Send + Sync {
    /// Compiles `expression` and stores `attribute` under `doc_id`.
    ///
    /// # Errors
    ///
    /// Malformed expressions and duplicate ids.
    fn insert(
        &mut self,
        doc_id: &str,
        expression: &str,
        attribute: CanonicalOffer,
    ) -> Result<(), IndexError>;

    /// Ids of the documents whose expression holds for `conditions` and whose
    /// attribute passes `predicate`.
    ///
    /// # Errors
    ///
    /// Returns an error if `conditions` are unusable.
    fn search(
        &self,
        conditions: &Conditions,
        predicate: &dyn Fn(&CanonicalOffer) -> bool,
    ) -> Result<Vec<DocId>, IndexError>;

    /// # Errors
    ///
    /// `IndexError::NotFound` for unknown ids.
    fn get_attribute(&self, doc_id: &str) -> Result<Arc<CanonicalOffer>, IndexError>;

    /// Attributes of page `page` (zero based) in insertion order.
    fn dump_by_page(&self, page: usize, page_size: usize) -> Vec<Arc<CanonicalOffer>>;

    fn dump_by_filter(&self, filter: &dyn Fn(&CanonicalOffer) -> bool) -> Vec<Arc<CanonicalOffer>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for fresh, empty indexes.
pub trait IndexEngine: Send + Sync + 'static {
    type Index: SearchIndex + 'static;

    fn new_index(&self) -> Self::Index;
}
