use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The template catalog as returned by the store: template name to body.
pub type TemplateMap = Map<String, Value>;

/// A single document living in a concrete index of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_type")]
    pub doc_type: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: Map<String, Value>,
}

impl Document {
    pub fn new(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        source: Map<String, Value>,
    ) -> Document {
        Document { index: index.into(), doc_type: doc_type.into(), id: id.into(), source }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    #[default]
    Index,
    Create,
    Update,
    Delete,
}

/// One entry of a bulk request. Serializes with the underscored field names
/// the store's bulk helpers use, which is also the on-disk shape of the
/// pending-history recovery file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkAction {
    #[serde(rename = "_op_type", default)]
    pub op_type: OpType,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_type")]
    pub doc_type: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: Map<String, Value>,
}

impl BulkAction {
    /// An `index` action writing the given document where it says it lives.
    pub fn index(document: Document) -> BulkAction {
        let Document { index, doc_type, id, source } = document;
        BulkAction { op_type: OpType::Index, index, doc_type, id, source }
    }
}

/// The mappings and settings of one index, in the shape accepted by the
/// store's index-creation API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub settings: Value,
    pub mappings: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bulk request was rejected: {0}")]
    BulkRejected(String),
    #[error("unexpected response from the store: {0}")]
    UnexpectedResponse(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// The surface the migration engine needs from the index store.
///
/// Implementations are expected to be plain blocking calls; the engine is
/// strictly sequential. Scans must use the store's stable document order so
/// that repeated scans of an untouched index yield the same sequence.
pub trait IndexStore {
    /// The server version string as reported by the store root endpoint.
    fn server_version(&self) -> Result<String, StoreError>;

    /// Names of the concrete indexes matching a wildcard pattern, open or
    /// closed. A pattern matching nothing yields an empty list, not an error.
    fn list_indexes(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    fn index_exists(&self, index: &str) -> Result<bool, StoreError>;

    fn create_index(&self, index: &str, config: &IndexConfig) -> Result<(), StoreError>;

    /// Deleting an absent index yields `StoreError::NotFound`.
    fn delete_index(&self, index: &str) -> Result<(), StoreError>;

    fn index_config(&self, index: &str) -> Result<IndexConfig, StoreError>;

    fn templates(&self) -> Result<TemplateMap, StoreError>;

    /// With `create` set, the call fails if the template already exists;
    /// otherwise it overwrites.
    fn put_template(&self, name: &str, body: &Value, create: bool) -> Result<(), StoreError>;

    fn delete_template(&self, name: &str) -> Result<(), StoreError>;

    /// Iterate every document of an index in document order.
    fn scan<'a>(
        &'a self,
        index: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Document, StoreError>> + 'a>, StoreError>;

    /// Execute a bulk request. Per-item rejections surface as
    /// `StoreError::BulkRejected` so the writer can retry them.
    fn bulk(&self, actions: &[BulkAction]) -> Result<(), StoreError>;

    /// Give the store time to make recent mutations visible to reads.
    /// Remote implementations sleep here; embedded ones need not.
    fn settle(&self, _seconds: u64) {}
}

impl<S: IndexStore + ?Sized> IndexStore for &S {
    fn server_version(&self) -> Result<String, StoreError> {
        (**self).server_version()
    }

    fn list_indexes(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        (**self).list_indexes(pattern)
    }

    fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        (**self).index_exists(index)
    }

    fn create_index(&self, index: &str, config: &IndexConfig) -> Result<(), StoreError> {
        (**self).create_index(index, config)
    }

    fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        (**self).delete_index(index)
    }

    fn index_config(&self, index: &str) -> Result<IndexConfig, StoreError> {
        (**self).index_config(index)
    }

    fn templates(&self) -> Result<TemplateMap, StoreError> {
        (**self).templates()
    }

    fn put_template(&self, name: &str, body: &Value, create: bool) -> Result<(), StoreError> {
        (**self).put_template(name, body, create)
    }

    fn delete_template(&self, name: &str) -> Result<(), StoreError> {
        (**self).delete_template(name)
    }

    fn scan<'a>(
        &'a self,
        index: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Document, StoreError>> + 'a>, StoreError> {
        (**self).scan(index)
    }

    fn bulk(&self, actions: &[BulkAction]) -> Result<(), StoreError> {
        (**self).bulk(actions)
    }

    fn settle(&self, seconds: u64) {
        (**self).settle(seconds)
    }
}
