// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashSet;

use indexmap::IndexMap;
use migrates_core::pattern::Pattern;
use migrates_core::{
    BulkAction, Document, IndexConfig, IndexStore, OpType, StoreError, TemplateMap,
};
use serde_json::{json, Map, Value};

/// An in-memory index store. Indexes keep their documents in insertion
/// order, which stands in for the store's stable document order. The
/// `fail_*` fields inject one failure per matching name (or per call for
/// counters), which is how the recovery scenarios force a run to die in a
/// specific stage.
pub struct MemoryStore {
    inner: RefCell<Inner>,
    pub fail_create_index: RefCell<HashSet<String>>,
    pub fail_put_template: RefCell<HashSet<String>>,
    pub fail_bulk_for_index: RefCell<HashSet<String>>,
    pub fail_bulk: Cell<u32>,
    pub bulk_calls: Cell<u32>,
}

#[derive(Default)]
struct Inner {
    version: String,
    indexes: IndexMap<String, IndexData>,
    templates: TemplateMap,
}

struct IndexData {
    config: IndexConfig,
    documents: Vec<Document>,
}

impl IndexData {
    fn empty() -> IndexData {
        IndexData {
            config: IndexConfig { settings: json!({}), mappings: json!({}) },
            documents: Vec::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::with_version("5.6.3")
    }

    pub fn with_version(version: &str) -> MemoryStore {
        MemoryStore {
            inner: RefCell::new(Inner { version: version.to_string(), ..Inner::default() }),
            fail_create_index: RefCell::new(HashSet::new()),
            fail_put_template: RefCell::new(HashSet::new()),
            fail_bulk_for_index: RefCell::new(HashSet::new()),
            fail_bulk: Cell::new(0),
            bulk_calls: Cell::new(0),
        }
    }

    pub fn seed_index(&self, index: &str) {
        self.inner.borrow_mut().indexes.insert(index.to_string(), IndexData::empty());
    }

    pub fn seed_document(&self, document: Document) {
        let mut inner = self.inner.borrow_mut();
        let data = inner
            .indexes
            .entry(document.index.clone())
            .or_insert_with(IndexData::empty);
        data.documents.push(document);
    }

    pub fn seed_template(&self, name: &str, body: Value) {
        self.inner.borrow_mut().templates.insert(name.to_string(), body);
    }

    pub fn index_names(&self) -> Vec<String> {
        self.inner.borrow().indexes.keys().cloned().collect()
    }

    pub fn documents(&self, index: &str) -> Vec<Document> {
        self.inner
            .borrow()
            .indexes
            .get(index)
            .map(|data| data.documents.clone())
            .unwrap_or_default()
    }

    pub fn templates_snapshot(&self) -> TemplateMap {
        self.inner.borrow().templates.clone()
    }

    fn upsert(data: &mut IndexData, document: Document) {
        let slot = data
            .documents
            .iter_mut()
            .find(|existing| existing.doc_type == document.doc_type && existing.id == document.id);
        match slot {
            Some(existing) => *existing = document,
            None => data.documents.push(document),
        }
    }
}

impl IndexStore for MemoryStore {
    fn server_version(&self) -> Result<String, StoreError> {
        Ok(self.inner.borrow().version.clone())
    }

    fn list_indexes(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = Pattern::new(pattern);
        Ok(self
            .inner
            .borrow()
            .indexes
            .keys()
            .filter(|name| pattern.matches(name))
            .cloned()
            .collect())
    }

    fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        Ok(self.inner.borrow().indexes.contains_key(index))
    }

    fn create_index(&self, index: &str, config: &IndexConfig) -> Result<(), StoreError> {
        if self.fail_create_index.borrow_mut().remove(index) {
            return Err(StoreError::Transport(format!("injected create failure for {index}")));
        }
        self.inner.borrow_mut().indexes.insert(
            index.to_string(),
            IndexData { config: config.clone(), documents: Vec::new() },
        );
        Ok(())
    }

    fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        match self.inner.borrow_mut().indexes.shift_remove(index) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(index.to_string())),
        }
    }

    fn index_config(&self, index: &str) -> Result<IndexConfig, StoreError> {
        self.inner
            .borrow()
            .indexes
            .get(index)
            .map(|data| data.config.clone())
            .ok_or_else(|| StoreError::NotFound(index.to_string()))
    }

    fn templates(&self) -> Result<TemplateMap, StoreError> {
        Ok(self.inner.borrow().templates.clone())
    }

    fn put_template(&self, name: &str, body: &Value, create: bool) -> Result<(), StoreError> {
        if self.fail_put_template.borrow_mut().remove(name) {
            return Err(StoreError::Transport(format!("injected template failure for {name}")));
        }
        let mut inner = self.inner.borrow_mut();
        if create && inner.templates.contains_key(name) {
            return Err(StoreError::UnexpectedResponse(format!(
                "template {name} already exists"
            )));
        }
        inner.templates.insert(name.to_string(), body.clone());
        Ok(())
    }

    fn delete_template(&self, name: &str) -> Result<(), StoreError> {
        match self.inner.borrow_mut().templates.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn scan<'a>(
        &'a self,
        index: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Document, StoreError>> + 'a>, StoreError> {
        let documents = match self.inner.borrow().indexes.get(index) {
            Some(data) => data.documents.clone(),
            None => return Err(StoreError::NotFound(index.to_string())),
        };
        Ok(Box::new(documents.into_iter().map(Ok)))
    }

    fn bulk(&self, actions: &[BulkAction]) -> Result<(), StoreError> {
        self.bulk_calls.set(self.bulk_calls.get() + 1);
        if self.fail_bulk.get() > 0 {
            self.fail_bulk.set(self.fail_bulk.get() - 1);
            return Err(StoreError::BulkRejected("injected bulk rejection".to_string()));
        }
        {
            let failing = self.fail_bulk_for_index.borrow();
            if let Some(name) = actions.iter().find(|action| failing.contains(&action.index)) {
                let name = name.index.clone();
                drop(failing);
                self.fail_bulk_for_index.borrow_mut().remove(&name);
                return Err(StoreError::Transport(format!(
                    "injected bulk failure for {name}"
                )));
            }
        }
        let mut inner = self.inner.borrow_mut();
        for action in actions {
            let data = inner
                .indexes
                .entry(action.index.clone())
                .or_insert_with(IndexData::empty);
            match action.op_type {
                OpType::Delete => {
                    data.documents.retain(|existing| {
                        existing.doc_type != action.doc_type || existing.id != action.id
                    });
                }
                OpType::Index | OpType::Create | OpType::Update => {
                    MemoryStore::upsert(
                        data,
                        Document::new(
                            action.index.clone(),
                            action.doc_type.clone(),
                            action.id.clone(),
                            action.source.clone(),
                        ),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Seed `count` documents into `index`, cycling `x` through 0..100 with
/// `y = x`, split across the given document types round-robin.
pub fn seed_numbered_documents(
    store: &MemoryStore,
    index: &str,
    doc_types: &[&str],
    count: usize,
) {
    store.seed_index(index);
    for i in 0..count {
        let x = (i % 100) as i64;
        let mut source = Map::new();
        source.insert("x".to_string(), Value::from(x));
        source.insert("y".to_string(), Value::from(x));
        store.seed_document(Document::new(
            index,
            doc_types[i % doc_types.len()],
            i.to_string(),
            source,
        ));
    }
}

/// The (doc_type, id, source) triples of an index, sorted, for multiset
/// comparisons across runs.
pub fn document_triples(store: &MemoryStore, index: &str) -> Vec<(String, String, String)> {
    let mut triples: Vec<(String, String, String)> = store
        .documents(index)
        .into_iter()
        .map(|document| {
            (document.doc_type, document.id, Value::Object(document.source).to_string())
        })
        .collect();
    triples.sort();
    triples
}

pub fn field_i64(document: &Document, field: &str) -> i64 {
    document.source.get(field).and_then(Value::as_i64).unwrap_or_else(|| {
        panic!("document {}/{} lacks numeric field {field}", document.index, document.id)
    })
}
