use crate::value::ValueKind;

/// Result alias used throughout the crate.
pub type Result<T, E = AccessError> = std::result::Result<T, E>;

/// Every failure a caller can observe.
///
/// Errors carry a human-readable cause only; raw engine result codes are
/// reduced to their message before they get here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("unable to provision database: {0}")]
    ProvisioningFailed(String),

    #[error("unable to open database: {0}")]
    ConnectionOpenFailed(String),

    #[error("statement requires {required} parameters but no parameters were provided")]
    MissingParameters { required: usize },

    #[error("statement requires {required} parameters, {provided} provided")]
    ParameterCountMismatch { required: usize, provided: usize },

    #[error("parameter {index} has unsupported type {kind}")]
    UnsupportedParameterType { index: usize, kind: ValueKind },

    #[error("unable to bind parameter {index}: {message}")]
    ParameterBindFailed { index: usize, message: String },

    #[error("unable to begin transaction ({0})")]
    TransactionStartFailed(String),

    #[error("statement {index} failed: {message}")]
    StatementFailed { index: usize, message: String },

    #[error("transaction failed ({cause}){}. Rolled back", at_statement(.index))]
    TransactionFailed {
        cause: Box<AccessError>,
        index: Option<usize>,
        rollback_error: Option<String>,
    },

    #[error("unable to commit transaction ({0})")]
    CommitFailed(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("unable to close database: {0}")]
    CloseFailed(String),
}

fn at_statement(index: &Option<usize>) -> String {
    match index {
        Some(index) => format!(" at statement {index}"),
        None => String::new(),
    }
}

impl AccessError {
    pub fn description(&self) -> String {
        self.to_string()
    }

    /// The innermost cause, looking through `TransactionFailed` wrappers.
    pub fn root_cause(&self) -> &AccessError {
        match self {
            AccessError::TransactionFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub(crate) fn statement(index: usize, err: &rusqlite::Error) -> Self {
        AccessError::StatementFailed {
            index,
            message: engine_message(err),
        }
    }
}

/// Extract the engine's message from a rusqlite error without leaking the
/// numeric result code.
pub(crate) fn engine_message(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.clone(),
        rusqlite::Error::SqliteFailure(failure, None) => format!("{:?}", failure.code),
        other => other.to_string(),
    }
}
