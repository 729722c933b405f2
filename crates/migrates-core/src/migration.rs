use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use time::macros::date;
use time::Date;

use crate::error::{Error, Result, TransformError};
use crate::pattern::Pattern;
use crate::store::{Document, TemplateMap};

/// The earliest date a migration may carry. Engine-synthesized migrations use
/// exactly this date so they always sort before user migrations.
pub const MIN_MIGRATION_DATE: Date = date!(1900 - 01 - 01);

/// Transforms one document. Returning `None` deletes the document.
pub type DocumentTransform =
    Arc<dyn Fn(Document) -> Result<Option<Document>, TransformError> + Send + Sync>;

/// Transforms the whole template catalog.
pub type TemplateTransform =
    Arc<dyn Fn(TemplateMap) -> Result<TemplateMap, TransformError> + Send + Sync>;

/// One document-transformation entry: which indexes and document types it
/// applies to, and the function to run.
#[derive(Clone)]
pub struct DocumentRule {
    index_pattern: Pattern,
    type_pattern: Pattern,
    transform: DocumentTransform,
}

/// A named, dated bundle of document and template transformations.
#[derive(Clone)]
pub struct Migration {
    name: String,
    date: Date,
    description: Option<String>,
    repeat: bool,
    internal: bool,
    document_rules: Vec<DocumentRule>,
    template_transform: Option<TemplateTransform>,
}

impl Migration {
    pub fn builder(name: impl Into<String>, date: Date) -> MigrationBuilder {
        MigrationBuilder {
            name: name.into(),
            date,
            description: None,
            repeat: false,
            internal: false,
            document_rules: Vec::new(),
            template_transform: None,
        }
    }

    /// A migration rewriting every document of `index` into itself, or into
    /// `target` when given. Marked internal since the synthesized name
    /// contains slashes.
    pub fn reindex(index: &str, target: Option<&str>) -> Migration {
        let (name, description, transform): (String, String, DocumentTransform) = match target {
            None => (
                format!("migrates/reindex/{index}"),
                format!("Reindex \"{index}\"."),
                Arc::new(|document| Ok(Some(document))),
            ),
            Some(target) => {
                let target = target.to_string();
                (
                    format!("migrates/reindex/{index}/{target}"),
                    format!("Reindex \"{index}\" to \"{target}\"."),
                    Arc::new(move |mut document: Document| {
                        document.index = target.clone();
                        Ok(Some(document))
                    }),
                )
            }
        };
        Migration {
            name,
            date: MIN_MIGRATION_DATE,
            description: Some(description),
            repeat: true,
            internal: true,
            document_rules: vec![DocumentRule {
                index_pattern: Pattern::new(index),
                type_pattern: Pattern::new("*"),
                transform,
            }],
            template_transform: None,
        }
    }

    /// A migration discarding the current template catalog in favor of the
    /// given one. Used to replay a templates recovery file.
    pub fn set_templates(templates: TemplateMap) -> Migration {
        Migration {
            name: "migrates/set_templates".to_string(),
            date: MIN_MIGRATION_DATE,
            description: Some("Set template data.".to_string()),
            repeat: true,
            internal: true,
            document_rules: Vec::new(),
            template_transform: Some(Arc::new(move |_| Ok(templates.clone()))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn date(&self) -> Date {
        self.date
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn internal(&self) -> bool {
        self.internal
    }

    /// The index patterns named by this migration's document rules, in
    /// declaration order.
    pub fn index_patterns(&self) -> impl Iterator<Item = &str> {
        self.document_rules.iter().map(|rule| rule.index_pattern.as_str())
    }

    /// Apply this migration's document transformation to a document, if one
    /// applies to its index and document type. Documents nothing applies to
    /// pass through unchanged.
    pub fn transform_document(&self, document: Document) -> Result<Option<Document>> {
        let transform = match self.document_transform_for(&document.index, &document.doc_type)? {
            Some(transform) => transform,
            None => return Ok(Some(document)),
        };
        let (index, doc_type, id) =
            (document.index.clone(), document.doc_type.clone(), document.id.clone());
        transform(document).map_err(|source| Error::Transform {
            migration: self.name.clone(),
            index,
            doc_type,
            id,
            source,
        })
    }

    /// Resolve the single rule applying to a document, enforcing that at most
    /// one index pattern and one document-type pattern match.
    fn document_transform_for(
        &self,
        index: &str,
        doc_type: &str,
    ) -> Result<Option<&DocumentTransform>> {
        let mut index_pattern: Option<&Pattern> = None;
        for rule in &self.document_rules {
            if !rule.index_pattern.matches(index) {
                continue;
            }
            match index_pattern {
                Some(previous) if *previous != rule.index_pattern => {
                    return Err(Error::AmbiguousIndexPattern {
                        migration: self.name.clone(),
                        index: index.to_string(),
                    });
                }
                _ => index_pattern = Some(&rule.index_pattern),
            }
        }
        let index_pattern = match index_pattern {
            Some(pattern) => pattern,
            None => return Ok(None),
        };
        let mut selected: Option<&DocumentRule> = None;
        for rule in &self.document_rules {
            if rule.index_pattern != *index_pattern || !rule.type_pattern.matches(doc_type) {
                continue;
            }
            match selected {
                Some(previous) if previous.type_pattern != rule.type_pattern => {
                    return Err(Error::AmbiguousTypePattern {
                        migration: self.name.clone(),
                        index: index.to_string(),
                        doc_type: doc_type.to_string(),
                    });
                }
                _ => selected = Some(rule),
            }
        }
        Ok(selected.map(|rule| &rule.transform))
    }

    /// Apply this migration's template transformation, if any.
    pub fn transform_templates(&self, templates: TemplateMap) -> Result<TemplateMap> {
        match &self.template_transform {
            Some(transform) => transform(templates).map_err(|source| Error::TemplateTransform {
                migration: self.name.clone(),
                source,
            }),
            None => Ok(templates),
        }
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .field("date", &self.date)
            .field("repeat", &self.repeat)
            .field("internal", &self.internal)
            .field("document_rules", &self.document_rules.len())
            .field("template_transform", &self.template_transform.is_some())
            .finish()
    }
}

pub struct MigrationBuilder {
    name: String,
    date: Date,
    description: Option<String>,
    repeat: bool,
    internal: bool,
    document_rules: Vec<DocumentRule>,
    template_transform: Option<TemplateTransform>,
}

impl MigrationBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// A repeating migration is always pending, regardless of history.
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Internal migrations are engine-synthesized and exempt from the
    /// registry's name restrictions.
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Register a document transformation for the indexes and document types
    /// matching the given patterns.
    pub fn transform_documents(
        mut self,
        index_pattern: &str,
        type_pattern: &str,
        transform: impl Fn(Document) -> Result<Option<Document>, TransformError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.document_rules.push(DocumentRule {
            index_pattern: Pattern::new(index_pattern),
            type_pattern: Pattern::new(type_pattern),
            transform: Arc::new(transform),
        });
        self
    }

    /// Register a transformation over the whole template catalog.
    pub fn transform_templates(
        mut self,
        transform: impl Fn(TemplateMap) -> Result<TemplateMap, TransformError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.template_transform = Some(Arc::new(transform));
        self
    }

    pub fn build(self) -> Result<Migration> {
        if self.date < MIN_MIGRATION_DATE {
            return Err(Error::DateTooEarly(self.date));
        }
        Ok(Migration {
            name: self.name,
            date: self.date,
            description: self.description,
            repeat: self.repeat,
            internal: self.internal,
            document_rules: self.document_rules,
            template_transform: self.template_transform,
        })
    }
}

/// The set of migrations known to the engine, keyed by their unique names.
#[derive(Default)]
pub struct Registry {
    migrations: IndexMap<String, Migration>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn add(&mut self, migration: Migration) -> Result<()> {
        if self.migrations.contains_key(migration.name()) {
            return Err(Error::DuplicateName(migration.name().to_string()));
        }
        if migration.name().contains('/') && !migration.internal() {
            return Err(Error::ForbiddenName(migration.name().to_string()));
        }
        self.migrations.insert(migration.name().to_string(), migration);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Migration> {
        self.migrations.get(name).ok_or_else(|| Error::UnknownMigration(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Every registered migration, sorted ascending by (date, name).
    pub fn all(&self) -> Vec<&Migration> {
        let mut migrations: Vec<&Migration> = self.migrations.values().collect();
        sort_migrations_by_ref(&mut migrations);
        migrations
    }

    /// The migrations awaiting execution: those whose name is not among the
    /// performed ones, plus every repeating migration. Sorted ascending by
    /// (date, name).
    pub fn pending(&self, performed: &HashSet<String>) -> Vec<Migration> {
        let mut pending: Vec<Migration> = self
            .migrations
            .values()
            .filter(|migration| migration.repeat() || !performed.contains(migration.name()))
            .cloned()
            .collect();
        sort_migrations(&mut pending);
        pending
    }
}

pub(crate) fn sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| (a.date(), a.name()).cmp(&(b.date(), b.name())));
}

fn sort_migrations_by_ref(migrations: &mut [&Migration]) {
    migrations.sort_by(|a, b| (a.date(), a.name()).cmp(&(b.date(), b.name())));
}

/// The distinct index patterns named by any document rule of any of the given
/// migrations, in first-seen order. This is what determines which concrete
/// indexes a run touches.
pub fn merged_index_patterns<'a>(
    migrations: impl IntoIterator<Item = &'a Migration>,
) -> Vec<String> {
    let mut patterns = Vec::new();
    for migration in migrations {
        for pattern in migration.index_patterns() {
            if !patterns.iter().any(|existing| existing == pattern) {
                patterns.push(pattern.to_string());
            }
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use big_s::S;
    use serde_json::{Map, Value};

    use super::*;

    fn doc(index: &str, doc_type: &str, id: &str) -> Document {
        Document::new(index, doc_type, id, Map::new())
    }

    fn migration(name: &str, date: Date) -> Migration {
        Migration::builder(name, date).build().unwrap()
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = Registry::new();
        registry.add(migration("m0", date!(2017 - 01 - 01))).unwrap();
        let err = registry.add(migration("m0", date!(2017 - 02 - 01))).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "m0"));
    }

    #[test]
    fn registry_rejects_slashes_in_user_names() {
        let mut registry = Registry::new();
        let err = registry.add(migration("bad/name", date!(2017 - 01 - 01))).unwrap_err();
        assert!(matches!(err, Error::ForbiddenName(_)));

        // Internal migrations are synthesized with slashed names.
        registry.add(Migration::reindex("t_0", None)).unwrap();
        assert!(registry.get("migrates/reindex/t_0").is_ok());
    }

    #[test]
    fn builder_rejects_dates_before_1900() {
        let err = Migration::builder("m0", date!(1899 - 12 - 31)).build().unwrap_err();
        assert!(matches!(err, Error::DateTooEarly(_)));
    }

    #[test]
    fn pending_filters_performed_and_sorts_by_date_then_name() {
        let mut registry = Registry::new();
        registry.add(migration("b", date!(2017 - 01 - 01))).unwrap();
        registry.add(migration("a", date!(2017 - 01 - 01))).unwrap();
        registry.add(migration("c", date!(2016 - 06 - 01))).unwrap();
        registry
            .add(Migration::builder("again", date!(2017 - 03 - 01)).repeat(true).build().unwrap())
            .unwrap();

        let performed: HashSet<String> = [S("b"), S("again")].into_iter().collect();
        let pending = registry.pending(&performed);
        let names: Vec<&str> = pending.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["c", "a", "again"]);

        let all: Vec<&str> = registry.all().into_iter().map(|m| m.name()).collect();
        assert_eq!(all, vec!["c", "a", "b", "again"]);
    }

    #[test]
    fn documents_without_matching_rule_pass_through() {
        let migration = Migration::builder("m0", date!(2017 - 01 - 01))
            .transform_documents("t_*", "test", |_| Ok(None))
            .build()
            .unwrap();
        let result = migration.transform_document(doc("other", "test", "0")).unwrap();
        assert_eq!(result, Some(doc("other", "test", "0")));
        let result = migration.transform_document(doc("t_0", "other", "0")).unwrap();
        assert_eq!(result, Some(doc("t_0", "other", "0")));
    }

    #[test]
    fn matching_rule_can_rewrite_or_delete() {
        let migration = Migration::builder("m0", date!(2017 - 01 - 01))
            .transform_documents("t_*", "test_*", |mut document| {
                if document.id == "drop" {
                    return Ok(None);
                }
                document.source.insert(S("x"), Value::from(1));
                Ok(Some(document))
            })
            .build()
            .unwrap();

        let kept = migration.transform_document(doc("t_0", "test_0", "keep")).unwrap().unwrap();
        assert_eq!(kept.source.get("x"), Some(&Value::from(1)));
        assert_eq!(migration.transform_document(doc("t_0", "test_0", "drop")).unwrap(), None);
    }

    #[test]
    fn overlapping_index_patterns_are_ambiguous() {
        let migration = Migration::builder("m0", date!(2017 - 01 - 01))
            .transform_documents("t_*", "*", |document| Ok(Some(document)))
            .transform_documents("t_0", "*", |document| Ok(Some(document)))
            .build()
            .unwrap();
        let err = migration.transform_document(doc("t_0", "test", "0")).unwrap_err();
        assert!(matches!(err, Error::AmbiguousIndexPattern { .. }));
        // Only one pattern matches this index, so no ambiguity.
        assert!(migration.transform_document(doc("t_1", "test", "0")).is_ok());
    }

    #[test]
    fn overlapping_type_patterns_are_ambiguous() {
        let migration = Migration::builder("m0", date!(2017 - 01 - 01))
            .transform_documents("t_0", "test_*", |document| Ok(Some(document)))
            .transform_documents("t_0", "*", |document| Ok(Some(document)))
            .build()
            .unwrap();
        let err = migration.transform_document(doc("t_0", "test_0", "0")).unwrap_err();
        assert!(matches!(err, Error::AmbiguousTypePattern { .. }));
    }

    #[test]
    fn transform_errors_carry_the_document_coordinates() {
        let migration = Migration::builder("m0", date!(2017 - 01 - 01))
            .transform_documents("t_0", "*", |_| Err(TransformError::new("boom")))
            .build()
            .unwrap();
        let err = migration.transform_document(doc("t_0", "test", "42")).unwrap_err();
        match err {
            Error::Transform { migration, index, id, .. } => {
                assert_eq!(migration, "m0");
                assert_eq!(index, "t_0");
                assert_eq!(id, "42");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reindex_builds_internal_repeating_migrations() {
        let plain = Migration::reindex("a", None);
        assert_eq!(plain.name(), "migrates/reindex/a");
        assert_eq!(plain.date(), MIN_MIGRATION_DATE);
        assert!(plain.repeat() && plain.internal());
        let kept = plain.transform_document(doc("a", "t", "0")).unwrap().unwrap();
        assert_eq!(kept.index, "a");

        let renaming = Migration::reindex("a", Some("b"));
        assert_eq!(renaming.name(), "migrates/reindex/a/b");
        let moved = renaming.transform_document(doc("a", "t", "0")).unwrap().unwrap();
        assert_eq!(moved.index, "b");
    }

    #[test]
    fn set_templates_ignores_its_input() {
        let mut templates = TemplateMap::new();
        templates.insert(S("tmpl"), serde_json::json!({"template": "t_*"}));
        let migration = Migration::set_templates(templates.clone());

        let mut other = TemplateMap::new();
        other.insert(S("other"), serde_json::json!({}));
        assert_eq!(migration.transform_templates(other).unwrap(), templates);
    }

    #[test]
    fn merged_index_patterns_deduplicates_in_order() {
        let first = Migration::builder("m0", date!(2017 - 01 - 01))
            .transform_documents("t_*", "*", |document| Ok(Some(document)))
            .transform_documents("u_0", "*", |document| Ok(Some(document)))
            .build()
            .unwrap();
        let second = Migration::builder("m1", date!(2017 - 01 - 02))
            .transform_documents("t_*", "*", |document| Ok(Some(document)))
            .build()
            .unwrap();
        assert_eq!(merged_index_patterns([&first, &second]), vec![S("t_*"), S("u_0")]);
    }
}
