use std::collections::HashSet;

use serde_json::{json, Map, Value};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, Time};
use tracing::info;

use crate::batch::Batch;
use crate::error::Result;
use crate::migration::Migration;
use crate::store::{BulkAction, Document, IndexStore, OpType, StoreError};

pub const DEFAULT_HISTORY_TEMPLATE: &str = "migrates_history_template";
pub const DEFAULT_HISTORY_INDEX: &str = "migrates_history";
pub const DEFAULT_HISTORY_DOC_TYPE: &str = "migration";

/// Timestamps as they are stored in history documents.
pub const TIMESTAMP_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

const TIMESTAMP_PARSE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

pub(crate) fn format_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).expect("known timestamp format")
}

/// Where migration history lives in the store.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub template: String,
    pub index: String,
    pub doc_type: String,
}

impl Default for HistoryConfig {
    fn default() -> HistoryConfig {
        HistoryConfig {
            template: DEFAULT_HISTORY_TEMPLATE.to_string(),
            index: DEFAULT_HISTORY_INDEX.to_string(),
            doc_type: DEFAULT_HISTORY_DOC_TYPE.to_string(),
        }
    }
}

/// An exact-match string field shaped for the server's major version.
pub fn keyword_field(server_major: u64) -> Value {
    if server_major >= 5 {
        json!({"type": "keyword", "index": true})
    } else {
        json!({"type": "string", "index": "not_analyzed"})
    }
}

/// One record of the migration history, as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: PrimitiveDateTime,
    pub migration_date: PrimitiveDateTime,
    pub name: String,
    pub description: Option<String>,
    pub internal: bool,
}

impl HistoryEntry {
    fn from_document(document: &Document) -> Option<HistoryEntry> {
        let parse = |field: &str| {
            let text = document.source.get(field)?.as_str()?;
            PrimitiveDateTime::parse(text.get(..19)?, TIMESTAMP_PARSE_FORMAT).ok()
        };
        Some(HistoryEntry {
            timestamp: parse("timestamp")?,
            migration_date: parse("migration_date")?,
            name: document.source.get("name")?.as_str()?.to_string(),
            description: document
                .source
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            internal: document
                .source
                .get("internal")
                .and_then(Value::as_bool)
                .unwrap_or_default(),
        })
    }
}

/// Reads and writes the migration history kept in the store itself.
pub struct HistoryStore<'a, S: IndexStore + ?Sized> {
    store: &'a S,
    config: &'a HistoryConfig,
}

impl<'a, S: IndexStore + ?Sized> HistoryStore<'a, S> {
    pub fn new(store: &'a S, config: &'a HistoryConfig) -> HistoryStore<'a, S> {
        HistoryStore { store, config }
    }

    /// Names of migrations recorded as performed. An absent history index
    /// means no migration has ever run.
    pub fn performed(&self) -> Result<HashSet<String>> {
        let documents = match self.store.scan(&self.config.index) {
            Ok(documents) => documents,
            Err(StoreError::NotFound(_)) => return Ok(HashSet::new()),
            Err(error) => return Err(error.into()),
        };
        let mut names = HashSet::new();
        for document in documents {
            let document = document?;
            if let Some(name) = document.source.get("name").and_then(Value::as_str) {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    /// The history template body, with string fields shaped for the server's
    /// major version.
    pub fn template_body(&self, server_major: u64) -> Value {
        let properties = json!({
            "timestamp": {"type": "date"},
            "migration_date": {"type": "date"},
            "name": keyword_field(server_major),
            "description": keyword_field(server_major),
            "internal": {"type": "boolean"},
        });
        let mut mappings = Map::new();
        mappings.insert(
            self.config.doc_type.clone(),
            json!({"dynamic": false, "properties": properties}),
        );
        let mut body = Map::new();
        body.insert("template".to_string(), Value::String(self.config.index.clone()));
        body.insert("mappings".to_string(), Value::Object(mappings));
        Value::Object(body)
    }

    /// Idempotently install the history template.
    pub fn ensure_template(&self, server_major: u64) -> Result<()> {
        self.store.put_template(
            &self.config.template,
            &self.template_body(server_major),
            false,
        )?;
        Ok(())
    }

    /// The bulk action recording one migration of a run that began at
    /// `timestamp` (with `stamp` its 14-digit rendering).
    pub fn action(
        &self,
        migration: &Migration,
        timestamp: OffsetDateTime,
        stamp: &str,
    ) -> BulkAction {
        let migration_date = migration
            .date()
            .with_time(Time::MIDNIGHT)
            .assume_utc();
        let mut source = Map::new();
        source.insert("timestamp".to_string(), Value::String(format_timestamp(timestamp)));
        source
            .insert("migration_date".to_string(), Value::String(format_timestamp(migration_date)));
        source.insert("name".to_string(), Value::String(migration.name().to_string()));
        source.insert(
            "description".to_string(),
            migration.description().map(|text| Value::String(text.to_string())).unwrap_or(Value::Null),
        );
        source.insert("internal".to_string(), Value::Bool(migration.internal()));
        BulkAction {
            op_type: OpType::Index,
            index: self.config.index.clone(),
            doc_type: self.config.doc_type.clone(),
            id: format!("{}/{stamp}", migration.name()),
            source,
        }
    }

    /// Append history records through a bulk writer.
    pub fn write(&self, actions: Vec<BulkAction>) -> Result<()> {
        info!("writing {} migration history entries", actions.len());
        let mut batch = Batch::new(self.store);
        batch.add_all(actions)?;
        batch.finish()
    }

    /// Every history entry whose timestamp falls in the given range, sorted
    /// ascending by (timestamp, migration date). An absent history index
    /// yields nothing.
    pub fn entries(
        &self,
        begin: Option<PrimitiveDateTime>,
        end: Option<PrimitiveDateTime>,
    ) -> Result<Vec<HistoryEntry>> {
        let documents = match self.store.scan(&self.config.index) {
            Ok(documents) => documents,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut entries = Vec::new();
        for document in documents {
            let document = document?;
            let entry = match HistoryEntry::from_document(&document) {
                Some(entry) => entry,
                None => continue,
            };
            if begin.is_some_and(|begin| entry.timestamp < begin)
                || end.is_some_and(|end| entry.timestamp > end)
            {
                continue;
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| {
            (a.timestamp, a.migration_date)
                .cmp(&(b.timestamp, b.migration_date))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }
}
