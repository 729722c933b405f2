use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;
use time::Date;
use tracing::{error, info};

use crate::migration::Migration;
use crate::pattern::Pattern;
use crate::store::Document;
use crate::Error;

/// Accumulates per-index and per-migration counters while documents are
/// migrated, and logs one full before/after diff per (index, document type)
/// pair for the indexes selected by the detail patterns.
pub struct DetailRecorder {
    patterns: Vec<Pattern>,
    index_touched: IndexMap<String, u64>,
    index_deleted: IndexMap<String, u64>,
    migration_touched: BTreeMap<(Date, String), u64>,
    migration_deleted: BTreeMap<(Date, String), u64>,
    migration_errors: BTreeMap<(Date, String), u64>,
    exceptions: IndexMap<(String, String), Vec<String>>,
    shown_doc_types: HashMap<String, HashSet<String>>,
    current: Option<CurrentDocument>,
}

struct CurrentDocument {
    index: String,
    doc_type: String,
    snapshot: Option<Document>,
    touched_by: Vec<String>,
    deleted_by: Option<String>,
    errored_by: Option<String>,
}

impl DetailRecorder {
    pub fn new(detail_patterns: &[String]) -> DetailRecorder {
        DetailRecorder {
            patterns: detail_patterns.iter().map(Pattern::new).collect(),
            index_touched: IndexMap::new(),
            index_deleted: IndexMap::new(),
            migration_touched: BTreeMap::new(),
            migration_deleted: BTreeMap::new(),
            migration_errors: BTreeMap::new(),
            exceptions: IndexMap::new(),
            shown_doc_types: HashMap::new(),
            current: None,
        }
    }

    fn detailed(&self, index: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(index))
    }

    /// To be called before applying migrations to a document.
    pub fn pre(&mut self, document: &Document) {
        *self.index_touched.entry(document.index.clone()).or_default() += 1;
        let already_shown = self
            .shown_doc_types
            .get(&document.index)
            .is_some_and(|types| types.contains(&document.doc_type));
        let snapshot = (self.detailed(&document.index) && !already_shown)
            .then(|| document.clone());
        self.current = Some(CurrentDocument {
            index: document.index.clone(),
            doc_type: document.doc_type.clone(),
            snapshot,
            touched_by: Vec::new(),
            deleted_by: None,
            errored_by: None,
        });
    }

    /// To be called for each migration touching the current document.
    pub fn touch(&mut self, migration: &Migration) {
        *self
            .migration_touched
            .entry((migration.date(), migration.name().to_string()))
            .or_default() += 1;
        if let Some(current) = &mut self.current {
            if current.snapshot.is_some() {
                current.touched_by.push(migration.name().to_string());
            }
        }
    }

    /// To be called when a migration deletes the current document.
    pub fn delete(&mut self, migration: &Migration) {
        *self
            .migration_deleted
            .entry((migration.date(), migration.name().to_string()))
            .or_default() += 1;
        if let Some(current) = &mut self.current {
            *self.index_deleted.entry(current.index.clone()).or_default() += 1;
            current.deleted_by = Some(migration.name().to_string());
        }
    }

    /// To be called when a migration fails on the current document.
    pub fn error(&mut self, migration: &Migration, error: &Error) {
        *self
            .migration_errors
            .entry((migration.date(), migration.name().to_string()))
            .or_default() += 1;
        if let Some(current) = &mut self.current {
            current.errored_by = Some(migration.name().to_string());
            self.exceptions
                .entry((current.index.clone(), current.doc_type.clone()))
                .or_default()
                .push(error.to_string());
        }
    }

    /// To be called after migrations have been applied to a document. The
    /// document is absent when a migration deleted it.
    pub fn post(&mut self, document: Option<&Document>) {
        let current = match self.current.take() {
            Some(current) => current,
            None => return,
        };
        let snapshot = match current.snapshot {
            Some(snapshot) => snapshot,
            None => return,
        };
        let name = format!("{}/{}/{}", snapshot.index, snapshot.doc_type, snapshot.id);
        info!(
            "document \"{name}\" was touched by {} migrations: {}",
            current.touched_by.len(),
            current.touched_by.join(", ")
        );
        if let Some(errored_by) = &current.errored_by {
            info!("document produced an error with migration \"{errored_by}\"");
        } else if let Some(deleted_by) = &current.deleted_by {
            info!("document was deleted by migration \"{deleted_by}\"");
        } else if let Some(document) = document {
            let before = serde_json::to_string_pretty(&snapshot)
                .unwrap_or_else(|_| "(unprintable)".to_string());
            let after = serde_json::to_string_pretty(document)
                .unwrap_or_else(|_| "(unprintable)".to_string());
            info!("the original document {name}:\n{before}");
            info!(
                "the migrated document {}/{}/{}:\n{after}",
                document.index, document.doc_type, document.id
            );
        }
        self.shown_doc_types.entry(current.index).or_default().insert(current.doc_type);
    }

    /// Log a summary of everything recorded during the run.
    pub fn report(&self) {
        let mut index_info: Vec<(&String, &u64)> = self.index_touched.iter().collect();
        index_info.sort_by_key(|(_, touched)| std::cmp::Reverse(**touched));
        for (index, touched) in index_info {
            let deleted = self.index_deleted.get(index).copied().unwrap_or_default();
            info!("in index \"{index}\": {touched} documents touched, {deleted} documents deleted");
        }
        for ((date, name), touched) in &self.migration_touched {
            let deleted =
                self.migration_deleted.get(&(*date, name.clone())).copied().unwrap_or_default();
            info!("migration \"{name}\": {touched} documents touched, {deleted} documents deleted");
        }
        let mut error_info: Vec<(&(Date, String), &u64)> = self.migration_errors.iter().collect();
        error_info.sort_by_key(|(_, errors)| std::cmp::Reverse(**errors));
        for ((date, name), errors) in error_info {
            let touched =
                self.migration_touched.get(&(*date, name.clone())).copied().unwrap_or_default();
            error!(
                "migration \"{name}\" produced {errors} errors out of {touched} touched documents"
            );
        }
        for ((index, doc_type), exceptions) in &self.exceptions {
            error!(
                "encountered {} errors for documents in \"{index}/{doc_type}\", including:",
                exceptions.len()
            );
            for exception in exceptions.iter().take(3) {
                error!("{exception}");
            }
        }
    }
}
