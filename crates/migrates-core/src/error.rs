use time::Date;

use crate::migrate::Stage;
use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error produced by a user-supplied document or template transformation.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> TransformError {
        TransformError(message.into())
    }
}

impl From<String> for TransformError {
    fn from(message: String) -> TransformError {
        TransformError(message)
    }
}

impl From<&str> for TransformError {
    fn from(message: &str) -> TransformError {
        TransformError(message.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("migration names must be unique (encountered duplicate name \"{0}\")")]
    DuplicateName(String),
    #[error("migration names must not contain forward slashes (\"{0}\")")]
    ForbiddenName(String),
    #[error("found no migration with name \"{0}\"")]
    UnknownMigration(String),
    #[error("migration dates must be at least 1900-01-01 (got {0})")]
    DateTooEarly(Date),
    #[error(
        "migration \"{migration}\" defines multiple document transformations \
         matching index \"{index}\", and their application order cannot be \
         guaranteed"
    )]
    AmbiguousIndexPattern { migration: String, index: String },
    #[error(
        "migration \"{migration}\" defines multiple document transformations \
         matching document type \"{doc_type}\" in index \"{index}\", and their \
         application order cannot be guaranteed"
    )]
    AmbiguousTypePattern { migration: String, index: String, doc_type: String },
    #[error("migration \"{migration}\" failed to transform document \"{index}/{doc_type}/{id}\"")]
    Transform {
        migration: String,
        index: String,
        doc_type: String,
        id: String,
        #[source]
        source: TransformError,
    },
    #[error("template transformation of migration \"{migration}\" failed")]
    TemplateTransform {
        migration: String,
        #[source]
        source: TransformError,
    },
    #[error("bulk write failed after {attempts} attempts")]
    BulkFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("index name \"{0}\" does not belong to a shadow index")]
    NotAShadowIndex(String),
    #[error("encountered unhandled error while {stage}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn at_stage(stage: Stage) -> impl FnOnce(Error) -> Error {
        move |source| Error::Stage { stage, source: Box::new(source) }
    }

    /// The failure state of a staged migration run, if this error came out
    /// of one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
