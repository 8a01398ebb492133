use anyhow::anyhow;
use url::ParseError;
use validator::ValidationErrors;

pub mod notification;
pub mod rule;
pub mod sync;
pub mod tag;
pub mod user;
pub mod view;

fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

impl std::fmt::Debug for OctotriageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(thiserror::Error)]
pub enum OctotriageError {
    #[error("Error while parsing enum")]
    InvalidEnumData {
        #[source]
        source: enum_derive::ParseEnumError,
        output: String,
    },
    #[error("Error while parsing URL")]
    InvalidUrlData {
        #[source]
        source: ParseError,
        output: String,
    },
    #[error("Invalid input data: {user_error}")]
    InvalidInputData {
        #[source]
        source: Option<sqlx::Error>,
        user_error: String,
    },
    #[error("Invalid parameters: {0}")]
    InvalidParameters(ValidationErrors),
    #[error("Invalid query at character {offset}: {message}")]
    InvalidQuery { offset: usize, message: String },
    #[error("A {kind} named `{name}` already exists")]
    AlreadyExists {
        #[source]
        source: Option<sqlx::Error>,
        kind: &'static str,
        name: String,
    },
    #[error("Item not found: {0}")]
    ItemNotFound(String),
    #[error("Database error: {message}")]
    DatabaseError {
        #[source]
        source: sqlx::Error,
        message: String,
    },
    #[error("Unauthorized access: {0}")]
    Unauthorized(anyhow::Error),
    #[error("Forbidden access: {0}")]
    Forbidden(String),
    /// Transient upstream or queue failure; workers let the queue retry it,
    /// the HTTP layer maps it to 503.
    #[error("Recoverable error: {0}")]
    Recoverable(#[source] anyhow::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl OctotriageError {
    pub fn from_json_serde_error(serde_error: serde_json::Error, input: String) -> Self {
        OctotriageError::Unexpected(anyhow!("{serde_error} while parsing: {input}"))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OctotriageError::Recoverable(_) | OctotriageError::DatabaseError { .. }
        )
    }
}

/// Outcome of an idempotent upsert. `Created` means a brand-new row was
/// inserted, which is what gates rule evaluation on re-delivered threads.
#[derive(Debug, Clone)]
pub enum UpsertStatus<T: Clone> {
    Created(T),
    Updated(T),
}

impl<T: Clone> UpsertStatus<T> {
    pub fn value(self) -> T {
        match self {
            UpsertStatus::Created(inner) | UpsertStatus::Updated(inner) => inner,
        }
    }

    pub fn value_ref(&self) -> &T {
        match self {
            UpsertStatus::Created(inner) | UpsertStatus::Updated(inner) => inner,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertStatus::Created(_))
    }
}
