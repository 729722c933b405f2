//! The command-line front-end of the migration engine. The standalone binary
//! ships with an empty registry; applications embed the tool by registering
//! their migrations and handing the registry to [`run`].

pub mod option;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser};
use migrates_core::history::{HistoryConfig, TIMESTAMP_FORMAT};
use migrates_core::recovery::{
    cleanup_recovery_files, load_history_actions, load_indexes, load_templates, CleanupOptions,
};
use migrates_core::{Migration, Migrator, MigratorOptions, Registry};
use migrates_http::HttpStore;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer;

use crate::option::{Cli, Command, GlobalOpt};

const DESCRIPTION_WIDTH: usize = 60;

/// Loads migration definitions from the package paths given on the command
/// line. The engine itself only knows compiled-in migrations; binaries that
/// support on-disk packages plug their loader in here.
pub trait MigrationLoader {
    fn load(&self, path: &Path, registry: &mut Registry) -> anyhow::Result<()>;
}

/// The loader of the standalone binary: it cannot load anything and says so.
pub struct NoLoader;

impl MigrationLoader for NoLoader {
    fn load(&self, path: &Path, _registry: &mut Registry) -> anyhow::Result<()> {
        anyhow::bail!(
            "cannot load migrations from \"{}\": this binary has no migration loader; \
             register migrations in code and rebuild",
            path.display()
        )
    }
}

/// Parse the command line and execute it against the given registry.
pub fn run(registry: Registry, loader: &dyn MigrationLoader) -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.global)?;

    let command = match cli.command {
        Some(command) => command,
        None => {
            Cli::command().print_help()?;
            return Ok(());
        }
    };

    let mut registry = registry;
    if matches!(command, Command::Run { .. } | Command::Migrations { .. }) {
        load_packages(&cli.global, loader, &mut registry)?;
    }

    let opt = &cli.global;
    match command {
        Command::Run { names } => run_migrations(&registry, opt, &names),
        Command::Reindex { specs } => reindex(opt, &specs),
        Command::History { begin, end } => show_history(opt, begin.as_deref(), end.as_deref()),
        Command::Migrations { pending } => show_migrations(&registry, opt, pending),
        Command::RestoreTemplates { file } => restore_templates(opt, &file),
        Command::RestoreIndexes { file } => restore_indexes(opt, &file),
        Command::RestoreHistory { file } => restore_history(opt, &file),
        Command::RestoreCleanup { older_than, keep_files } => {
            restore_cleanup(opt, older_than.as_deref(), keep_files)
        }
        Command::RemoveHistory => remove_history(opt),
        Command::RemoveDummies => remove_dummies(opt),
    }
}

fn setup_logging(opt: &GlobalOpt) -> anyhow::Result<()> {
    let level = if opt.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(level);
    let file_layer = match &opt.log {
        None => None,
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("while opening the log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(level),
            )
        }
    };
    tracing_subscriber::registry().with(stderr_layer).with(file_layer).init();
    Ok(())
}

fn load_packages(
    opt: &GlobalOpt,
    loader: &dyn MigrationLoader,
    registry: &mut Registry,
) -> anyhow::Result<()> {
    for path in &opt.path {
        anyhow::ensure!(
            path.exists(),
            "nonexistent migration package path \"{}\"",
            path.display()
        );
        loader
            .load(path, registry)
            .with_context(|| format!("while loading the migration package {}", path.display()))?;
    }
    Ok(())
}

fn restore_path(opt: &GlobalOpt) -> anyhow::Result<PathBuf> {
    let path = opt.restore_path.clone().unwrap_or_else(|| PathBuf::from("restore"));
    std::fs::create_dir_all(&path)
        .with_context(|| format!("while creating the recovery directory {}", path.display()))?;
    Ok(path)
}

fn migrator(opt: &GlobalOpt, no_history: bool) -> anyhow::Result<Migrator<HttpStore>> {
    if opt.host.is_empty() {
        info!("connecting to the local store host");
    } else {
        info!("connecting to store host(s) {}", opt.host.join(", "));
    }
    let store = HttpStore::new(&opt.host)?;
    let options = MigratorOptions {
        dry: opt.dry,
        no_history,
        keep_shadows: opt.keep_dummies,
        detail: opt.detail.clone(),
        recovery_path: Some(restore_path(opt)?),
        history: HistoryConfig {
            template: opt.history_template.clone(),
            index: opt.history_index.clone(),
            doc_type: opt.history_doc_type.clone(),
        },
        shadow_prefix: opt.dummy_index_prefix.clone(),
    };
    Ok(Migrator::new(store, options)?)
}

fn confirm(opt: &GlobalOpt, prompt: String) -> anyhow::Result<bool> {
    if opt.yes || opt.dry {
        return Ok(true);
    }
    Ok(dialoguer::Confirm::new().with_prompt(prompt).default(false).interact()?)
}

fn run_migrations(registry: &Registry, opt: &GlobalOpt, names: &[String]) -> anyhow::Result<()> {
    let migrator = migrator(opt, false)?;
    let (migrations, kind) = if names.is_empty() {
        (migrator.pending(registry)?, "pending")
    } else {
        let mut migrations = Vec::with_capacity(names.len());
        for name in names {
            migrations.push(registry.get(name)?.clone());
        }
        (migrations, "specified")
    };
    if migrations.is_empty() {
        return Ok(());
    }
    if !confirm(opt, format!("Run {} {kind} migrations?", migrations.len()))? {
        info!("exiting without running migrations");
        return Ok(());
    }
    Ok(migrator.migrate(migrations)?)
}

fn parse_reindex_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once("=>") {
        Some((source, target)) => (source.trim(), Some(target.trim())),
        None => (spec.trim(), None),
    }
}

fn reindex(opt: &GlobalOpt, specs: &[String]) -> anyhow::Result<()> {
    if specs.is_empty() {
        info!("nothing to reindex");
        return Ok(());
    }
    let migrator = migrator(opt, false)?;
    let mut migrations = Vec::with_capacity(specs.len());
    for spec in specs {
        let migration = match parse_reindex_spec(spec) {
            (source, Some(target)) => {
                info!("reindexing documents from \"{source}\" to \"{target}\"");
                Migration::reindex(source, Some(target))
            }
            (source, None) => {
                info!("reindexing documents in index \"{source}\"");
                Migration::reindex(source, None)
            }
        };
        migrations.push(migration);
    }
    if !confirm(opt, format!("Proceed with {} reindex actions?", migrations.len()))? {
        info!("exiting without reindexing");
        return Ok(());
    }
    migrator.migrate(migrations)?;
    info!("finished reindexing");
    Ok(())
}

fn show_history(opt: &GlobalOpt, begin: Option<&str>, end: Option<&str>) -> anyhow::Result<()> {
    let begin = begin.map(parse_timestamp).transpose()?;
    let end = end.map(parse_timestamp).transpose()?;
    match (begin, end) {
        (None, _) => info!("showing migration history from the dawn of time"),
        (Some(begin), None) => {
            info!("showing migration history from {} UTC and onward", display_timestamp(begin))
        }
        (Some(begin), Some(end)) => info!(
            "showing migration history from {} to {} UTC",
            display_timestamp(begin),
            display_timestamp(end)
        ),
    }
    let migrator = migrator(opt, false)?;
    let entries = migrator.history_entries(begin, end)?;
    if entries.is_empty() {
        info!("no migration history for this time period");
        return Ok(());
    }
    for entry in entries {
        info!(
            "{}: \"{}\", {}",
            display_timestamp(entry.timestamp),
            entry.name,
            truncate_description(entry.description.as_deref(), DESCRIPTION_WIDTH)
        );
    }
    Ok(())
}

fn show_migrations(registry: &Registry, opt: &GlobalOpt, pending: bool) -> anyhow::Result<()> {
    let migrations: Vec<Migration> = if pending {
        info!("showing pending registered migrations");
        migrator(opt, false)?.pending(registry)?
    } else {
        info!("showing all registered migrations");
        registry.all().into_iter().cloned().collect()
    };
    if migrations.is_empty() {
        info!("no registered migrations to show");
        return Ok(());
    }
    for migration in migrations {
        let date = migration.date().with_time(Time::MIDNIGHT);
        info!(
            "{}: \"{}\", {}",
            display_timestamp(date),
            migration.name(),
            truncate_description(migration.description(), DESCRIPTION_WIDTH)
        );
    }
    Ok(())
}

fn restore_templates(opt: &GlobalOpt, file: &Path) -> anyhow::Result<()> {
    let templates = load_templates(file)
        .with_context(|| format!("while loading the templates recovery file {}", file.display()))?;
    if !confirm(opt, format!("Set templates to those loaded from \"{}\"?", file.display()))? {
        info!("exiting without modifying data");
        return Ok(());
    }
    migrator(opt, true)?.restore_templates(templates)?;
    info!("finished restoring templates");
    Ok(())
}

fn restore_indexes(opt: &GlobalOpt, file: &Path) -> anyhow::Result<()> {
    let affected = load_indexes(file)
        .with_context(|| format!("while loading the indexes recovery file {}", file.display()))?;
    info!("found {} affected indexes: {}", affected.len(), affected.join(", "));
    if !confirm(
        opt,
        format!("Restore {} affected indexes loaded from \"{}\"?", affected.len(), file.display()),
    )? {
        info!("exiting without modifying data");
        return Ok(());
    }
    migrator(opt, true)?.restore_indexes(affected)?;
    info!("finished restoring indexes");
    Ok(())
}

fn restore_history(opt: &GlobalOpt, file: &Path) -> anyhow::Result<()> {
    let actions = load_history_actions(file)
        .with_context(|| format!("while loading the history recovery file {}", file.display()))?;
    if !confirm(
        opt,
        format!("Write {} migration history entries from \"{}\"?", actions.len(), file.display()),
    )? {
        info!("exiting without modifying data");
        return Ok(());
    }
    migrator(opt, false)?.restore_history(actions)?;
    info!("finished restoring migration history");
    Ok(())
}

fn restore_cleanup(
    opt: &GlobalOpt,
    older_than: Option<&str>,
    keep_files: usize,
) -> anyhow::Result<()> {
    let older_than = older_than.map(parse_timestamp).transpose()?;
    let prompt = match older_than {
        Some(cutoff) => format!("Remove recovery files older than {}?", display_timestamp(cutoff)),
        None => "Remove recovery files made since the beginning of time?".to_string(),
    };
    if !confirm(opt, prompt)? {
        info!("exiting without removing recovery files");
        return Ok(());
    }
    let directory = restore_path(opt)?;
    let options = CleanupOptions { older_than, keep_files, dry: opt.dry };
    cleanup_recovery_files(&directory, &options)?;
    info!("finished cleaning up recovery files");
    Ok(())
}

fn remove_history(opt: &GlobalOpt) -> anyhow::Result<()> {
    if opt.dry {
        info!("previewing migration history removal");
    }
    if !confirm(opt, format!("Remove migration history index \"{}\"?", opt.history_index))? {
        info!("exiting without removing migration history");
        return Ok(());
    }
    let migrator = migrator(opt, false)?;
    if !migrator.remove_history_index()? {
        info!("migration history index \"{}\" does not exist", opt.history_index);
    }
    info!("finished removing migration history");
    Ok(())
}

fn remove_dummies(opt: &GlobalOpt) -> anyhow::Result<()> {
    if opt.dry {
        info!("previewing dummy index removal");
    }
    let migrator = migrator(opt, false)?;
    let dummies = migrator.list_shadow_indexes()?;
    if dummies.is_empty() {
        info!("no dummy indexes to remove");
        return Ok(());
    }
    if !confirm(
        opt,
        format!("Remove all {} indexes prefixed with \"{}\"?", dummies.len(), opt.dummy_index_prefix),
    )? {
        info!("exiting without removing dummy indexes");
        return Ok(());
    }
    migrator.remove_shadow_indexes()?;
    info!("finished removing {} dummy indexes", dummies.len());
    Ok(())
}

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Accepts `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SSZ`, interpreted as UTC.
fn parse_timestamp(text: &str) -> anyhow::Result<PrimitiveDateTime> {
    let parsed = if text.ends_with('Z') {
        PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
    } else {
        Date::parse(text, DATE_FORMAT).map(|date| date.with_time(Time::MIDNIGHT))
    };
    parsed.with_context(|| {
        format!("invalid timestamp \"{text}\"; expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SSZ")
    })
}

fn display_timestamp(timestamp: PrimitiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).unwrap_or_else(|_| timestamp.to_string())
}

fn truncate_description(text: Option<&str>, width: usize) -> String {
    let text = match text {
        None | Some("") => return "(No description.)".to_string(),
        Some(text) => text,
    };
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn reindex_specs_split_on_the_arrow() {
        assert_eq!(parse_reindex_spec("a"), ("a", None));
        assert_eq!(parse_reindex_spec("a=>b"), ("a", Some("b")));
        assert_eq!(parse_reindex_spec(" a => b "), ("a", Some("b")));
    }

    #[test]
    fn timestamps_parse_in_both_accepted_formats() {
        assert_eq!(parse_timestamp("2017-04-01").unwrap(), datetime!(2017 - 04 - 01 00:00:00));
        assert_eq!(
            parse_timestamp("2017-04-01T13:18:59Z").unwrap(),
            datetime!(2017 - 04 - 01 13:18:59)
        );
        assert!(parse_timestamp("last tuesday").is_err());
    }

    #[test]
    fn descriptions_are_truncated_with_a_default() {
        assert_eq!(truncate_description(None, 10), "(No description.)");
        assert_eq!(truncate_description(Some(""), 10), "(No description.)");
        assert_eq!(truncate_description(Some("short"), 10), "short");
        assert_eq!(truncate_description(Some("much too long"), 10), "much to...");
    }

    #[test]
    fn cli_parses_the_documented_surface() {
        use clap::Parser;

        let cli = Cli::try_parse_from([
            "migrates", "run", "m0", "m1", "--dry", "-h", "http://example:9200", "-y",
        ])
        .unwrap();
        assert!(cli.global.dry);
        assert!(cli.global.yes);
        assert_eq!(cli.global.host, vec!["http://example:9200".to_string()]);
        match cli.command {
            Some(Command::Run { names }) => assert_eq!(names, vec!["m0", "m1"]),
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["migrates", "reindex", "a=>b"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Reindex { .. })));

        let cli =
            Cli::try_parse_from(["migrates", "restore_cleanup", "--keep-files", "2"]).unwrap();
        match cli.command {
            Some(Command::RestoreCleanup { keep_files, older_than }) => {
                assert_eq!(keep_files, 2);
                assert!(older_than.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
