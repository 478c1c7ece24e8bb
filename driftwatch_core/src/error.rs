use std::error::Error as StdError;

/// Common error type for `driftwatch_core`.
///
/// Concrete store and source implementations should preserve the
/// underlying error chain where possible via `Error::backend` /
/// `Error::transient`. The `Transient` variant marks failures the
/// orchestrator is allowed to retry (network timeouts, lock
/// contention); everything else fails the unit immediately.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("conversion failed for {resource_type}/{source_id}: {reason}")]
    Conversion {
        resource_type: String,
        source_id: String,
        reason: String,
    },

    #[error("transient error: {context}")]
    Transient {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn transient(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Conversion failure for one record; whether this aborts the run
    /// depends on the unit's `ConversionPolicy`.
    pub fn conversion(
        resource_type: impl Into<String>,
        source_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            resource_type: resource_type.into(),
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    /// True for failures worth retrying whole-unit under the bounded
    /// backoff policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        // SQLITE_BUSY / SQLITE_LOCKED are contention, not corruption.
        let locked = matches!(
            &e,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("5") || db.code().as_deref() == Some("6")
        );
        if locked || matches!(e, sqlx::Error::PoolTimedOut) {
            Self::transient("sqlx", e)
        } else {
            Self::backend("sqlx", e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
