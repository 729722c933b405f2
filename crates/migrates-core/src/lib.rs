//! The migration engine for a document-index store: a registry of named,
//! dated migrations and the staged pipeline that applies them — shadow-copy
//! the affected indexes, apply template changes, rewrite documents, record
//! history — with enough persisted state to recover from any interruption.
//!
//! Embedders register their migrations in code:
//!
//! ```
//! use migrates_core::{Migration, Registry};
//! use time::macros::date;
//!
//! let mut registry = Registry::new();
//! registry.add(
//!     Migration::builder("squash_x_into_y", date!(2017 - 01 - 01))
//!         .description("Replace y with x squared.")
//!         .transform_documents("t_0", "test_0", |mut document| {
//!             let x = document.source.get("x").cloned().unwrap_or_default();
//!             document.source.insert("y".to_string(), x);
//!             Ok(Some(document))
//!         })
//!         .build()?,
//! )?;
//! # Ok::<(), migrates_core::Error>(())
//! ```

pub mod batch;
pub mod detail;
mod error;
pub mod history;
pub mod migrate;
pub mod migration;
pub mod pattern;
pub mod recovery;
pub mod store;

pub use error::{Error, Result, TransformError};
pub use migrate::{Migrator, MigratorOptions, Stage, DEFAULT_SHADOW_PREFIX};
pub use migration::{Migration, MigrationBuilder, Registry, MIN_MIGRATION_DATE};
pub use store::{BulkAction, Document, IndexConfig, IndexStore, OpType, StoreError, TemplateMap};
