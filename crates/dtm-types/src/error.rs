use thiserror::Error;

/// Sentinel error taxonomy shared by the store, the barrier, the dispatcher
/// and the transaction engine. Every non-`Driver` variant is authoritative:
/// callers match on it rather than on message text.
#[derive(Debug, Error)]
pub enum DtmError {
    /// Business-authoritative failure. Triggers rollback/compensation;
    /// surfaced as HTTP 409 or `dtm_result: FAILURE`.
    #[error("failure")]
    Failure,

    /// Branch in progress; retry at the same interval without backoff.
    /// Surfaced as HTTP 425 or `dtm_result: ONGOING`.
    #[error("ongoing")]
    Ongoing,

    /// The branch barrier detected a repeat call; the participant should
    /// treat this as a success-equivalent for the message SDK.
    #[error("duplicated")]
    Duplicated,

    /// A store-level create hit a duplicate primary/unique key.
    #[error("unique key conflict")]
    UniqueConflict,

    /// A conditional update matched zero rows, or the entity does not
    /// exist. Callers translate this into a lost-update abandon or, at
    /// register-branch time, into `Failure`.
    #[error("not found")]
    NotFound,

    /// Transport, serialization, or storage-driver failure with no
    /// authoritative business meaning; retried with exponential backoff
    /// until `timeout_to_fail`.
    #[error("driver error: {0}")]
    Driver(String),
}

pub type DtmResult<T> = Result<T, DtmError>;

impl DtmError {
    pub fn driver(msg: impl std::fmt::Display) -> Self {
        DtmError::Driver(msg.to_string())
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DtmError::Failure)
    }

    pub fn is_ongoing(&self) -> bool {
        matches!(self, DtmError::Ongoing)
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for DtmError {
    fn from(e: sqlx::Error) -> Self {
        DtmError::Driver(e.to_string())
    }
}

impl From<reqwest::Error> for DtmError {
    fn from(e: reqwest::Error) -> Self {
        DtmError::Driver(e.to_string())
    }
}
