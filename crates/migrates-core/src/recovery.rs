use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use time::macros::format_description;
use time::PrimitiveDateTime;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{BulkAction, TemplateMap};

/// The format of the 14-digit stamp embedded in recovery file names.
pub const STAMP_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

/// Writes the three recovery files of a run: the original templates, the
/// affected index names, and the history actions that should be recorded on
/// success. All writes are skipped when recovery was disabled by not
/// supplying a directory.
pub struct RecoveryWriter {
    templates_path: Option<PathBuf>,
    indexes_path: Option<PathBuf>,
    migrations_path: Option<PathBuf>,
}

impl RecoveryWriter {
    pub fn new(directory: Option<&Path>, stamp: &str) -> RecoveryWriter {
        match directory {
            None => RecoveryWriter::disabled(),
            Some(directory) => RecoveryWriter {
                templates_path: Some(directory.join(format!("migrates.templates.{stamp}.json"))),
                indexes_path: Some(directory.join(format!("migrates.indexes.{stamp}.json"))),
                migrations_path: Some(directory.join(format!("migrates.migrations.{stamp}.json"))),
            },
        }
    }

    pub fn disabled() -> RecoveryWriter {
        RecoveryWriter { templates_path: None, indexes_path: None, migrations_path: None }
    }

    pub fn templates_path(&self) -> Option<&Path> {
        self.templates_path.as_deref()
    }

    pub fn indexes_path(&self) -> Option<&Path> {
        self.indexes_path.as_deref()
    }

    pub fn migrations_path(&self) -> Option<&Path> {
        self.migrations_path.as_deref()
    }

    pub fn write_templates(&self, templates: &TemplateMap) -> Result<()> {
        match &self.templates_path {
            None => debug!("skipping writing original template data"),
            Some(path) => {
                info!("writing original template data to {}", path.display());
                fs::write(path, serde_json::to_string(templates)?)?;
            }
        }
        Ok(())
    }

    pub fn write_indexes(&self, affected: &[String]) -> Result<()> {
        match &self.indexes_path {
            None => debug!("skipping writing affected index information"),
            Some(path) => {
                info!("writing affected index information to {}", path.display());
                fs::write(path, serde_json::to_string(affected)?)?;
            }
        }
        Ok(())
    }

    pub fn write_migrations(&self, actions: &[BulkAction]) -> Result<()> {
        match &self.migrations_path {
            None => debug!("skipping writing pending migration information"),
            Some(path) => {
                info!("writing pending migration information to {}", path.display());
                fs::write(path, serde_json::to_string(actions)?)?;
            }
        }
        Ok(())
    }
}

pub fn load_templates(path: &Path) -> Result<TemplateMap> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

pub fn load_indexes(path: &Path) -> Result<Vec<String>> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

pub fn load_history_actions(path: &Path) -> Result<Vec<BulkAction>> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

pub struct CleanupOptions {
    /// Only files stamped strictly before this instant are candidates.
    /// Without a cutoff every recovery file is a candidate.
    pub older_than: Option<PrimitiveDateTime>,
    /// Per kind, this many of the most recent files survive regardless of
    /// their age.
    pub keep_files: usize,
    pub dry: bool,
}

impl Default for CleanupOptions {
    fn default() -> CleanupOptions {
        CleanupOptions { older_than: None, keep_files: 4, dry: false }
    }
}

/// Remove old recovery files from a directory. Returns the removed paths
/// (the paths that would be removed, on a dry run).
pub fn cleanup_recovery_files(directory: &Path, options: &CleanupOptions) -> Result<Vec<PathBuf>> {
    let file_pattern = Regex::new(r"^migrates\.(indexes|templates|migrations)\.(\d{14})\.json$")
        .expect("static regex compiles");
    let mut candidates: HashMap<&str, Vec<(String, PathBuf)>> = HashMap::new();
    let mut retained: HashMap<&str, usize> = HashMap::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let captures = match file_pattern.captures(name) {
            Some(captures) => captures,
            None => continue,
        };
        let kind = match captures.get(1).map(|kind| kind.as_str()) {
            Some("indexes") => "indexes",
            Some("templates") => "templates",
            Some("migrations") => "migrations",
            _ => continue,
        };
        let stamp = &captures[2];
        let timestamp = match PrimitiveDateTime::parse(stamp, STAMP_FORMAT) {
            Ok(timestamp) => timestamp,
            Err(_) => continue,
        };
        match options.older_than {
            Some(cutoff) if timestamp >= cutoff => {
                *retained.entry(kind).or_default() += 1;
            }
            _ => candidates.entry(kind).or_default().push((stamp.to_string(), entry.path())),
        }
    }

    let mut removed = Vec::new();
    for (kind, mut files) in candidates {
        let already_kept = retained.get(kind).copied().unwrap_or_default();
        if already_kept < options.keep_files {
            // Most recent first; spare enough of them to reach the quota.
            files.sort_by(|a, b| b.0.cmp(&a.0));
            files.drain(..(options.keep_files - already_kept).min(files.len()));
        }
        info!("removing {} \"{kind}\" recovery files", files.len());
        for (_, path) in files {
            if options.dry {
                info!("file {} would be removed", path.display());
            } else {
                debug!("removing file {}", path.display());
                fs::remove_file(&path)?;
            }
            removed.push(path);
        }
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use big_s::S;
    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::*;
    use crate::store::{BulkAction, OpType};

    #[test]
    fn writes_and_reloads_all_three_files() {
        let dir = TempDir::new().unwrap();
        let writer = RecoveryWriter::new(Some(dir.path()), "20170401131859");

        let mut templates = TemplateMap::new();
        templates.insert(S("tmpl"), json!({"template": "t_*"}));
        writer.write_templates(&templates).unwrap();

        let affected = vec![S("t_0"), S("t_1")];
        writer.write_indexes(&affected).unwrap();

        let actions = vec![BulkAction {
            op_type: OpType::Index,
            index: S("migrates_history"),
            doc_type: S("migration"),
            id: S("m0/20170401131859"),
            source: json!({"name": "m0"}).as_object().unwrap().clone(),
        }];
        writer.write_migrations(&actions).unwrap();

        assert_eq!(load_templates(writer.templates_path().unwrap()).unwrap(), templates);
        assert_eq!(load_indexes(writer.indexes_path().unwrap()).unwrap(), affected);
        assert_eq!(load_history_actions(writer.migrations_path().unwrap()).unwrap(), actions);
    }

    #[test]
    fn disabled_writer_touches_nothing() {
        let writer = RecoveryWriter::disabled();
        writer.write_templates(&TemplateMap::new()).unwrap();
        writer.write_indexes(&[]).unwrap();
        writer.write_migrations(&[]).unwrap();
        assert!(writer.templates_path().is_none());
    }

    fn seed_recovery_files(dir: &Path, stamps: &[&str]) {
        for stamp in stamps {
            for kind in ["indexes", "templates", "migrations"] {
                fs::write(dir.join(format!("migrates.{kind}.{stamp}.json")), "[]").unwrap();
            }
        }
        fs::write(dir.join("unrelated.json"), "{}").unwrap();
    }

    #[test]
    fn cleanup_keeps_the_most_recent_files_per_kind() {
        let dir = TempDir::new().unwrap();
        let stamps = ["20170101000000", "20170201000000", "20170301000000"];
        seed_recovery_files(dir.path(), &stamps);

        let options = CleanupOptions { keep_files: 2, ..CleanupOptions::default() };
        let removed = cleanup_recovery_files(dir.path(), &options).unwrap();

        // Only the oldest stamp of each kind goes away.
        assert_eq!(removed.len(), 3);
        for path in &removed {
            assert!(path.to_str().unwrap().contains("20170101000000"));
        }
        assert!(dir.path().join("migrates.indexes.20170301000000.json").exists());
        assert!(dir.path().join("unrelated.json").exists());
    }

    #[test]
    fn cleanup_counts_recent_files_toward_the_quota() {
        let dir = TempDir::new().unwrap();
        let stamps = ["20170101000000", "20170201000000", "20170301000000"];
        seed_recovery_files(dir.path(), &stamps);

        // The newest stamp is past the cutoff, so with a quota of one the
        // remaining candidates are all removed.
        let options = CleanupOptions {
            older_than: Some(datetime!(2017 - 02 - 15 00:00:00)),
            keep_files: 1,
            dry: false,
        };
        let removed = cleanup_recovery_files(dir.path(), &options).unwrap();
        assert_eq!(removed.len(), 6);
        assert!(dir.path().join("migrates.templates.20170301000000.json").exists());
        assert!(!dir.path().join("migrates.templates.20170101000000.json").exists());
    }

    #[test]
    fn dry_cleanup_removes_nothing() {
        let dir = TempDir::new().unwrap();
        seed_recovery_files(dir.path(), &["20170101000000"]);
        let options =
            CleanupOptions { keep_files: 0, dry: true, ..CleanupOptions::default() };
        let removed = cleanup_recovery_files(dir.path(), &options).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(dir.path().join("migrates.indexes.20170101000000.json").exists());
    }
}
