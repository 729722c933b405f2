use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use migrates_core::history::{
    DEFAULT_HISTORY_DOC_TYPE, DEFAULT_HISTORY_INDEX, DEFAULT_HISTORY_TEMPLATE,
};
use migrates_core::DEFAULT_SHADOW_PREFIX;

// `-h` is taken by `--host`, so the automatic help flag is disabled
// everywhere and a long-only `--help` is provided as a global argument.
#[derive(Debug, Parser)]
#[command(
    name = "migrates",
    version,
    about = "Schema and data migration tool for document index stores",
    disable_help_flag = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub global: GlobalOpt,
}

#[derive(Debug, Args)]
pub struct GlobalOpt {
    /// Paths to packages containing user migration definitions.
    #[arg(short = 'p', long = "path", num_args = 1.., global = true)]
    pub path: Vec<PathBuf>,

    /// Store hosts to connect to; defaults to the local host.
    #[arg(short = 'h', long = "host", num_args = 1.., global = true)]
    pub host: Vec<String>,

    /// Index patterns to log per-document migration detail for.
    #[arg(short = 'l', long = "detail", num_args = 1.., global = true)]
    pub detail: Vec<String>,

    /// Preview the operation without modifying the store.
    #[arg(short = 'd', long = "dry", global = true)]
    pub dry: bool,

    /// Keep intermediate dummy indexes instead of removing them afterwards.
    #[arg(short = 'k', long = "keep-dummies", global = true)]
    pub keep_dummies: bool,

    /// Directory to write recovery files to.
    #[arg(short = 'r', long = "restore-path", global = true)]
    pub restore_path: Option<PathBuf>,

    /// Skip confirmation prompts. Implied by --dry.
    #[arg(short = 'y', long = "yes", global = true)]
    pub yes: bool,

    /// Also log trivia.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Append log output to this file as well as the console.
    #[arg(long = "log", global = true)]
    pub log: Option<PathBuf>,

    /// Name of the server-side template backing the history index.
    #[arg(long = "history-template", default_value = DEFAULT_HISTORY_TEMPLATE, global = true)]
    pub history_template: String,

    /// Name of the index the migration history is stored in.
    #[arg(long = "history-index", default_value = DEFAULT_HISTORY_INDEX, global = true)]
    pub history_index: String,

    /// Document type of migration history records.
    #[arg(long = "history-doc-type", default_value = DEFAULT_HISTORY_DOC_TYPE, global = true)]
    pub history_doc_type: String,

    /// Prefix of the intermediate dummy indexes created during migration.
    #[arg(long = "dummy-index-prefix", default_value = DEFAULT_SHADOW_PREFIX, global = true)]
    pub dummy_index_prefix: String,

    /// Print help.
    #[arg(long = "help", action = clap::ArgAction::Help, global = true)]
    help: Option<bool>,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
pub enum Command {
    /// Apply every pending migration, or only the named ones.
    #[command(disable_help_flag = true)]
    Run {
        /// Names of registered migrations to run instead of the pending set.
        names: Vec<String>,
    },

    /// Rewrite indexes into themselves, or into a new name with "a=>b".
    #[command(disable_help_flag = true)]
    Reindex {
        /// Index names, each optionally suffixed with "=>target".
        specs: Vec<String>,
    },

    /// Show the recorded migration history, optionally bounded in time.
    #[command(disable_help_flag = true)]
    History {
        /// Inclusive lower bound, as YYYY-MM-DD or YYYY-MM-DDTHH:MM:SSZ UTC.
        begin: Option<String>,
        /// Inclusive upper bound.
        end: Option<String>,
    },

    /// List the registered migrations.
    #[command(disable_help_flag = true)]
    Migrations {
        /// Only show migrations that are currently pending.
        #[arg(long)]
        pending: bool,
    },

    /// Replay a templates recovery file.
    #[command(disable_help_flag = true)]
    RestoreTemplates { file: PathBuf },

    /// Replay an indexes recovery file, copying documents back out of the
    /// surviving dummy indexes.
    #[command(disable_help_flag = true)]
    RestoreIndexes { file: PathBuf },

    /// Replay a pending-history recovery file.
    #[command(disable_help_flag = true)]
    RestoreHistory { file: PathBuf },

    /// Remove old recovery files.
    #[command(disable_help_flag = true)]
    RestoreCleanup {
        /// Only remove files older than this timestamp.
        #[arg(long = "older-than")]
        older_than: Option<String>,
        /// Per kind, keep this many of the most recent files regardless.
        #[arg(long = "keep-files", default_value_t = 4)]
        keep_files: usize,
    },

    /// Delete the migration history index.
    #[command(disable_help_flag = true)]
    RemoveHistory,

    /// Delete every index carrying the dummy prefix.
    #[command(disable_help_flag = true)]
    RemoveDummies,
}
