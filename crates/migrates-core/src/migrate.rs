use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde_json::Value;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::detail::DetailRecorder;
use crate::error::{Error, Result};
use crate::history::{HistoryConfig, HistoryEntry, HistoryStore};
use crate::migration::{merged_index_patterns, sort_migrations, Migration, Registry};
use crate::pattern::Pattern;
use crate::recovery::{RecoveryWriter, STAMP_FORMAT};
use crate::store::{BulkAction, IndexConfig, IndexStore, StoreError, TemplateMap};

/// Prefix of the intermediate indexes that hold the rollback copy of every
/// affected index while its documents are rewritten.
pub const DEFAULT_SHADOW_PREFIX: &str = "migrates_dummy_";

/// The stages of a migration run. A failed run reports the stage it died in,
/// which is what decides the recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvePending,
    ReadTemplates,
    PersistOriginalTemplates,
    PersistPendingHistory,
    ResolveAffected,
    ComputeUpdatedTemplates,
    StageShadows,
    ApplyTemplates,
    MigrateDocuments,
    WriteHistory,
}

impl Stage {
    /// Whether a failure in this stage leaves the store untouched.
    fn no_store_damage(self) -> bool {
        matches!(
            self,
            Stage::ResolvePending
                | Stage::ReadTemplates
                | Stage::PersistOriginalTemplates
                | Stage::PersistPendingHistory
                | Stage::ResolveAffected
                | Stage::ComputeUpdatedTemplates
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ResolvePending => "getting pending migrations",
            Stage::ReadTemplates => "retrieving templates",
            Stage::PersistOriginalTemplates => "backing up template data",
            Stage::PersistPendingHistory => "recording pending migrations",
            Stage::ResolveAffected => "getting affected indexes",
            Stage::ComputeUpdatedTemplates => "transforming templates",
            Stage::StageShadows => "creating shadow indexes",
            Stage::ApplyTemplates => "persisting templates",
            Stage::MigrateDocuments => "migrating documents",
            Stage::WriteHistory => "recording migration history",
        })
    }
}

pub struct MigratorOptions {
    pub dry: bool,
    pub no_history: bool,
    /// Leave shadow indexes behind instead of cleaning them up.
    pub keep_shadows: bool,
    /// Index patterns for which per-document detail is logged.
    pub detail: Vec<String>,
    /// Directory for recovery files; `None` disables them.
    pub recovery_path: Option<PathBuf>,
    pub history: HistoryConfig,
    pub shadow_prefix: String,
}

impl Default for MigratorOptions {
    fn default() -> MigratorOptions {
        MigratorOptions {
            dry: false,
            no_history: false,
            keep_shadows: false,
            detail: Vec::new(),
            recovery_path: None,
            history: HistoryConfig::default(),
            shadow_prefix: DEFAULT_SHADOW_PREFIX.to_string(),
        }
    }
}

/// Drives the staged migration pipeline against one store.
pub struct Migrator<S> {
    store: S,
    options: MigratorOptions,
    server_major: u64,
}

impl<S: IndexStore> Migrator<S> {
    /// Connects the engine to a store; probes the server version, which
    /// shapes the history template fields.
    pub fn new(store: S, options: MigratorOptions) -> Result<Migrator<S>> {
        let version = store.server_version()?;
        debug!("found server version {version}");
        let server_major =
            version.split('.').next().and_then(|major| major.parse().ok()).unwrap_or(0);
        Ok(Migrator { store, options, server_major })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &MigratorOptions {
        &self.options
    }

    pub fn server_major(&self) -> u64 {
        self.server_major
    }

    pub fn shadow_index(&self, index: &str) -> String {
        format!("{}{index}", self.options.shadow_prefix)
    }

    fn original_index(&self, shadow: &str) -> Result<String> {
        shadow
            .strip_prefix(&self.options.shadow_prefix)
            .map(str::to_string)
            .ok_or_else(|| Error::NotAShadowIndex(shadow.to_string()))
    }

    fn history(&self) -> HistoryStore<'_, S> {
        HistoryStore::new(&self.store, &self.options.history)
    }

    /// The registered migrations awaiting execution, judged against the
    /// history stored in the store, in application order.
    pub fn pending(&self, registry: &Registry) -> Result<Vec<Migration>> {
        debug!("getting pending migrations");
        let performed = self.history().performed()?;
        let pending = registry.pending(&performed);
        if pending.is_empty() {
            info!("found no pending migrations");
        } else {
            let names: Vec<&str> = pending.iter().map(Migration::name).collect();
            info!("found {} pending migrations: {}", pending.len(), names.join(", "));
        }
        Ok(pending)
    }

    /// Resolve the pending migrations and run them.
    pub fn migrate_pending(&self, registry: &Registry) -> Result<()> {
        let pending = self.pending(registry).map_err(Error::at_stage(Stage::ResolvePending))?;
        self.migrate(pending)
    }

    /// Run the given migrations through the staged pipeline. On failure the
    /// appropriate recovery action runs before the error is returned.
    pub fn migrate(&self, mut migrations: Vec<Migration>) -> Result<()> {
        if migrations.is_empty() {
            info!("no migrations to apply");
            return Ok(());
        }
        sort_migrations(&mut migrations);
        let mut run = Run::new(self, migrations);
        match run.execute() {
            Ok(()) => {
                if self.options.dry {
                    info!("finished migration dry run");
                } else {
                    info!("migration completed successfully");
                }
                Ok(())
            }
            Err(failure) => {
                run.recover(&failure);
                Err(failure)
            }
        }
    }

    /// Replay a templates recovery file: discard the current catalog in
    /// favor of the loaded one.
    pub fn restore_templates(&self, templates: TemplateMap) -> Result<()> {
        self.migrate(vec![Migration::set_templates(templates)])
    }

    /// Replay an indexes recovery file: recreate each affected index from
    /// its surviving shadow and copy the documents back.
    pub fn restore_indexes(&self, affected: Vec<String>) -> Result<()> {
        let configs = self.index_configs(&affected, true)?;
        self.revert_indexes(&affected, &configs)?;
        if self.options.keep_shadows {
            debug!("keeping shadow indexes");
        } else {
            let shadows: Vec<String> =
                affected.iter().map(|index| self.shadow_index(index)).collect();
            self.remove_indexes(&shadows)?;
        }
        Ok(())
    }

    /// Replay a pending-history recovery file verbatim.
    pub fn restore_history(&self, actions: Vec<BulkAction>) -> Result<()> {
        let history = self.history();
        if let Err(error) = history.ensure_template(self.server_major) {
            warn!("failed to enforce existence of the migration history template: {error}");
        }
        if self.options.dry {
            return Ok(());
        }
        history.write(actions)
    }

    pub fn list_shadow_indexes(&self) -> Result<Vec<String>> {
        Ok(self.store.list_indexes(&format!("{}*", self.options.shadow_prefix))?)
    }

    /// Delete every index carrying the shadow prefix. Returns the names that
    /// were (or, on a dry run, would be) removed.
    pub fn remove_shadow_indexes(&self) -> Result<Vec<String>> {
        let shadows = self.list_shadow_indexes()?;
        self.remove_indexes(&shadows)?;
        Ok(shadows)
    }

    /// Delete the history index. Returns whether it existed.
    pub fn remove_history_index(&self) -> Result<bool> {
        let index = &self.options.history.index;
        if !self.store.index_exists(index)? {
            return Ok(false);
        }
        info!("removing migration history index \"{index}\"");
        if !self.options.dry {
            self.store.delete_index(index)?;
        }
        Ok(true)
    }

    pub fn history_entries(
        &self,
        begin: Option<PrimitiveDateTime>,
        end: Option<PrimitiveDateTime>,
    ) -> Result<Vec<HistoryEntry>> {
        self.history().entries(begin, end)
    }

    /// Sleep long enough for the store to make recent mutations visible,
    /// scaled to how many indexes the run touches. Dry runs never wait.
    fn wait(&self, affected: usize) {
        if self.options.dry {
            return;
        }
        self.store.settle(affected.clamp(5, 20) as u64);
    }

    /// Snapshot the mappings and settings of the given indexes, from their
    /// shadows when requested. Indexes that vanished are skipped.
    fn index_configs(
        &self,
        indexes: &[String],
        from_shadows: bool,
    ) -> Result<HashMap<String, IndexConfig>> {
        debug!("retrieving index mappings and settings");
        let mut configs = HashMap::new();
        for index in indexes {
            let target = if from_shadows { self.shadow_index(index) } else { index.clone() };
            debug!("retrieving settings for index \"{target}\"");
            match self.store.index_config(&target) {
                Ok(mut config) => {
                    strip_server_owned_settings(&mut config.settings);
                    configs.insert(index.clone(), config);
                }
                Err(StoreError::NotFound(_)) => {
                    debug!("could not get settings for nonexistent index \"{target}\"");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(configs)
    }

    fn remove_indexes(&self, indexes: &[String]) -> Result<()> {
        debug!("removing {} indexes", indexes.len());
        for index in indexes {
            info!("removing index \"{index}\"");
            if self.options.dry {
                continue;
            }
            match self.store.delete_index(index) {
                Err(StoreError::NotFound(_)) => {
                    debug!("failed to remove nonexistent index \"{index}\"");
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Bring the store's template catalog from `original` to `updated`:
    /// changed and deleted names are removed, then changed and new names are
    /// put back with `create` set. Unchanged names are untouched. Removal of
    /// an already-absent template is tolerated so that the same delta can be
    /// replayed over a partially applied catalog.
    fn apply_template_changes(&self, original: &TemplateMap, updated: &TemplateMap) -> Result<()> {
        let detail_patterns: Vec<Pattern> =
            self.options.detail.iter().map(Pattern::new).collect();
        info!("writing migrated templates");
        let mut unchanged: Vec<&str> = Vec::new();
        let mut any_changes = false;
        for (name, body) in original {
            if updated.get(name) == Some(body) {
                debug!("found unchanged template \"{name}\"");
                unchanged.push(name.as_str());
                continue;
            }
            any_changes = true;
            match updated.get(name) {
                None => info!("removing deleted template \"{name}\""),
                Some(updated_body) => {
                    info!("removing changed template \"{name}\"");
                    if detail_patterns.iter().any(|pattern| pattern.matches(name)) {
                        info!("original template \"{name}\":\n{}", pretty(body));
                        info!("updated template \"{name}\":\n{}", pretty(updated_body));
                    }
                }
            }
            if self.options.dry {
                continue;
            }
            match self.store.delete_template(name) {
                Err(StoreError::NotFound(_)) => debug!("template \"{name}\" was already absent"),
                other => other?,
            }
        }
        for (name, body) in updated {
            if unchanged.contains(&name.as_str()) {
                continue;
            }
            any_changes = true;
            if original.contains_key(name) {
                info!("adding changed template \"{name}\"");
            } else {
                info!("adding new template \"{name}\"");
            }
            if !self.options.dry {
                self.store.put_template(name, body, true)?;
            }
        }
        if !any_changes {
            info!("no templates were affected");
        }
        Ok(())
    }

    /// Recreate each affected index from its snapshot and copy the documents
    /// back out of its shadow. Indexes whose shadow is gone cannot be
    /// recovered and are reported.
    fn revert_indexes(
        &self,
        affected: &[String],
        configs: &HashMap<String, IndexConfig>,
    ) -> Result<()> {
        info!("reverting changes made to store indexes and documents");
        for index in affected {
            let shadow = self.shadow_index(index);
            if !self.store.index_exists(&shadow)? {
                error!("no shadow index exists for affected index \"{index}\"");
                error!("documents cannot be recovered if the shadow does not exist");
                continue;
            }
            info!("recreating affected index \"{index}\"");
            if self.options.dry {
                continue;
            }
            if self.store.index_exists(index)? {
                self.store.delete_index(index)?;
            }
            let config = configs
                .get(index)
                .ok_or_else(|| Error::Store(StoreError::NotFound(index.clone())))?;
            self.store.create_index(index, config)?;
        }
        self.wait(affected.len());
        let mut batch = Batch::new(&self.store);
        for index in affected {
            let shadow = self.shadow_index(index);
            if !self.store.index_exists(&shadow)? {
                continue;
            }
            info!("copying documents from shadow index \"{shadow}\" to original index \"{index}\"");
            if self.options.dry {
                continue;
            }
            for document in self.store.scan(&shadow)? {
                let mut document = document?;
                document.index = index.clone();
                batch.add(BulkAction::index(document))?;
            }
        }
        batch.finish()
    }
}

/// The state of one migration run, discarded when the run ends.
struct Run<'a, S: IndexStore> {
    migrator: &'a Migrator<S>,
    timestamp: OffsetDateTime,
    stamp: String,
    recovery: RecoveryWriter,
    migrations: Vec<Migration>,
    affected: Vec<String>,
    configs: HashMap<String, IndexConfig>,
    original_templates: TemplateMap,
    updated_templates: TemplateMap,
}

impl<'a, S: IndexStore> Run<'a, S> {
    fn new(migrator: &'a Migrator<S>, migrations: Vec<Migration>) -> Run<'a, S> {
        let timestamp = OffsetDateTime::now_utc();
        let stamp = timestamp.format(STAMP_FORMAT).expect("known stamp format");
        let recovery = RecoveryWriter::new(migrator.options.recovery_path.as_deref(), &stamp);
        Run {
            migrator,
            timestamp,
            stamp,
            recovery,
            migrations,
            affected: Vec::new(),
            configs: HashMap::new(),
            original_templates: TemplateMap::new(),
            updated_templates: TemplateMap::new(),
        }
    }

    fn store(&self) -> &'a S {
        &self.migrator.store
    }

    fn dry(&self) -> bool {
        self.migrator.options.dry
    }

    fn execute(&mut self) -> Result<()> {
        self.read_templates().map_err(Error::at_stage(Stage::ReadTemplates))?;
        self.persist_original_templates()
            .map_err(Error::at_stage(Stage::PersistOriginalTemplates))?;
        self.persist_pending_history().map_err(Error::at_stage(Stage::PersistPendingHistory))?;
        self.resolve_affected().map_err(Error::at_stage(Stage::ResolveAffected))?;
        self.compute_updated_templates()
            .map_err(Error::at_stage(Stage::ComputeUpdatedTemplates))?;
        self.stage_shadows().map_err(Error::at_stage(Stage::StageShadows))?;
        self.apply_templates().map_err(Error::at_stage(Stage::ApplyTemplates))?;
        self.migrate_documents().map_err(Error::at_stage(Stage::MigrateDocuments))?;
        self.delete_shadows();
        self.write_history().map_err(Error::at_stage(Stage::WriteHistory))?;
        Ok(())
    }

    fn read_templates(&mut self) -> Result<()> {
        debug!("retrieving templates from the store");
        self.original_templates = self.store().templates()?;
        Ok(())
    }

    fn persist_original_templates(&self) -> Result<()> {
        if self.dry() {
            return Ok(());
        }
        self.recovery.write_templates(&self.original_templates)
    }

    fn history_actions(&self) -> Vec<BulkAction> {
        let history = self.migrator.history();
        self.migrations
            .iter()
            .map(|migration| history.action(migration, self.timestamp, &self.stamp))
            .collect()
    }

    fn persist_pending_history(&self) -> Result<()> {
        if self.dry() {
            return Ok(());
        }
        self.recovery.write_migrations(&self.history_actions())
    }

    fn resolve_affected(&mut self) -> Result<()> {
        debug!("determining affected indexes");
        let mut affected: Vec<String> = Vec::new();
        for pattern in merged_index_patterns(&self.migrations) {
            for index in self.store().list_indexes(&pattern)? {
                if !affected.contains(&index) {
                    affected.push(index);
                }
            }
        }
        self.affected = affected;
        if !self.dry() {
            self.recovery.write_indexes(&self.affected)?;
        }
        if self.affected.is_empty() {
            info!("found no affected indexes");
        } else {
            info!(
                "found {} affected indexes: {}",
                self.affected.len(),
                self.affected.join(", ")
            );
        }
        if !self.dry() {
            self.configs = self.migrator.index_configs(&self.affected, false)?;
        }
        Ok(())
    }

    fn compute_updated_templates(&mut self) -> Result<()> {
        debug!("transforming templates with {} migrations", self.migrations.len());
        let mut updated = self.original_templates.clone();
        for migration in &self.migrations {
            debug!("transforming templates with migration \"{migration}\"");
            updated = migration.transform_templates(updated)?;
        }
        self.updated_templates = updated;
        Ok(())
    }

    fn stage_shadows(&self) -> Result<()> {
        if self.affected.is_empty() || self.dry() {
            return Ok(());
        }
        info!("creating shadow indexes");
        for index in &self.affected {
            let shadow = self.migrator.shadow_index(index);
            if self.store().index_exists(&shadow)? {
                info!("deleting then recreating shadow index \"{shadow}\"");
                self.store().delete_index(&shadow)?;
            } else {
                info!("creating shadow index \"{shadow}\"");
            }
            let config = self
                .configs
                .get(index)
                .ok_or_else(|| Error::Store(StoreError::NotFound(index.clone())))?;
            self.store().create_index(&shadow, config)?;
        }
        self.migrator.wait(self.affected.len());
        info!("populating shadow indexes");
        let mut batch = Batch::new(self.store());
        for index in &self.affected {
            let shadow = self.migrator.shadow_index(index);
            info!("populating shadow index \"{shadow}\" with documents from \"{index}\"");
            for document in self.store().scan(index)? {
                let mut document = document?;
                document.index = shadow.clone();
                batch.add(BulkAction::index(document))?;
            }
        }
        batch.finish()
    }

    fn apply_templates(&self) -> Result<()> {
        self.migrator.apply_template_changes(&self.original_templates, &self.updated_templates)
    }

    fn migrate_documents(&self) -> Result<()> {
        if self.affected.is_empty() {
            return Ok(());
        }
        if !self.dry() {
            self.migrator.remove_indexes(&self.affected)?;
        }
        self.migrator.wait(self.affected.len());
        let mut detail = DetailRecorder::new(&self.migrator.options.detail);
        let mut batch = Batch::new(self.store());
        for index in &self.affected {
            info!("transforming documents in index \"{index}\"");
            let scan_target =
                if self.dry() { index.clone() } else { self.migrator.shadow_index(index) };
            for document in self.store().scan(&scan_target)? {
                let mut document = document?;
                if !self.dry() {
                    document.index = self.migrator.original_index(&document.index)?;
                }
                detail.pre(&document);
                let mut outcome = Some(document);
                for migration in &self.migrations {
                    let current = match outcome.take() {
                        Some(current) => current,
                        None => break,
                    };
                    detail.touch(migration);
                    match migration.transform_document(current) {
                        Ok(Some(next)) => outcome = Some(next),
                        Ok(None) => {
                            detail.delete(migration);
                            break;
                        }
                        Err(failure) => {
                            detail.error(migration, &failure);
                            if self.dry() {
                                break;
                            }
                            return Err(failure);
                        }
                    }
                }
                detail.post(outcome.as_ref());
                if let Some(document) = outcome {
                    if !self.dry() {
                        batch.add(BulkAction::index(document))?;
                    }
                }
            }
        }
        batch.finish()?;
        detail.report();
        Ok(())
    }

    fn delete_shadows(&self) {
        if self.dry() {
            return;
        }
        if self.migrator.options.keep_shadows {
            debug!("keeping shadow indexes");
            return;
        }
        let shadows: Vec<String> =
            self.affected.iter().map(|index| self.migrator.shadow_index(index)).collect();
        if let Err(failure) = self.migrator.remove_indexes(&shadows) {
            warn!("failed to remove shadow indexes: {failure}");
            warn!("run `migrates remove_dummies` to clean them up");
        }
    }

    fn write_history(&self) -> Result<()> {
        if self.migrator.options.no_history || self.dry() {
            return Ok(());
        }
        let history = self.migrator.history();
        if let Err(failure) = history.ensure_template(self.migrator.server_major) {
            warn!("failed to enforce existence of the migration history template: {failure}");
        }
        history.write(self.history_actions())
    }

    /// Act on a failed run according to the stage it died in.
    fn recover(&self, failure: &Error) {
        let stage = failure.stage().unwrap_or(Stage::ResolvePending);
        error!("{}", describe(failure));
        if self.dry() {
            info!("migration dry run failed; store data was not modified");
            return;
        }
        if stage.no_store_damage() {
            info!("store data was not modified, and no recovery action is necessary");
            return;
        }
        match stage {
            Stage::StageShadows => {
                info!("existing store data was not modified, though shadow indexes may have been created");
                info!("please do not terminate the process before recovery is complete");
                self.remove_shadows_after_failure();
                info!("recovery complete");
            }
            Stage::ApplyTemplates => {
                info!("store templates may have been modified and shadow indexes may have been created");
                info!("please do not terminate the process before recovery is complete");
                self.remove_shadows_after_failure();
                self.revert_template_changes();
                info!("recovery complete");
            }
            Stage::MigrateDocuments => {
                info!("store templates and indexes may have been modified and shadow indexes may have been created");
                info!("please do not terminate the process before recovery is complete");
                self.revert_template_changes();
                self.revert_index_changes();
                info!("recovery complete");
            }
            Stage::WriteHistory => {
                info!("no recovery action will be taken");
                if let Some(path) = self.recovery.migrations_path() {
                    warn!(
                        "run `migrates restore_history \"{}\"` to attempt recording migration history again",
                        path.display()
                    );
                }
            }
            _ => info!("no recovery action will be taken"),
        }
    }

    fn remove_shadows_after_failure(&self) {
        if self.migrator.options.keep_shadows {
            debug!("keeping shadow indexes");
            return;
        }
        info!("removing {} shadow indexes", self.affected.len());
        let shadows: Vec<String> =
            self.affected.iter().map(|index| self.migrator.shadow_index(index)).collect();
        if let Err(failure) = self.migrator.remove_indexes(&shadows) {
            warn!("failed to remove shadow indexes: {failure}");
        }
    }

    fn revert_template_changes(&self) {
        if self.updated_templates == self.original_templates {
            info!("migration made no changes to templates; nothing to revert");
            return;
        }
        info!("reverting changes to store templates");
        if let Err(failure) = self
            .migrator
            .apply_template_changes(&self.updated_templates, &self.original_templates)
        {
            error!("failed to revert templates: {}", describe(&failure));
            if let Some(path) = self.recovery.templates_path() {
                warn!(
                    "run `migrates restore_templates \"{}\"` to attempt template recovery again",
                    path.display()
                );
            }
        }
    }

    fn revert_index_changes(&self) {
        match self.migrator.revert_indexes(&self.affected, &self.configs) {
            Ok(()) => self.remove_shadows_after_failure(),
            Err(failure) => {
                error!(
                    "failed to recover data: {}; the original documents should still exist in \
                     indexes prefixed with \"{}\"",
                    describe(&failure),
                    self.migrator.options.shadow_prefix
                );
                if let Some(path) = self.recovery.indexes_path() {
                    warn!(
                        "run `migrates restore_indexes \"{}\"` to attempt index recovery again",
                        path.display()
                    );
                }
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// The error and its chain of causes, joined into one line.
fn describe(error: &Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn strip_server_owned_settings(settings: &mut Value) {
    // The store reports these on retrieval but rejects them on creation.
    if let Some(index) = settings.get_mut("index").and_then(Value::as_object_mut) {
        for field in ["creation_date", "uuid", "version", "provided_name"] {
            index.remove(field);
        }
    }
}
