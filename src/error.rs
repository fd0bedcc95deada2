use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error("Operator `{operator}` cannot be used on field `{field}`: {reason}")]
    OperatorTypeMismatch { field: String, operator: String, reason: String },
    #[error("Operator `{operator}` on field `{field}` requires a value")]
    EmptyValue { field: String, operator: String },
    #[error("Requested page size {requested} exceeds the maximum of {maximum}")]
    LimitExceeded { requested: u64, maximum: u64 },
    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),
    #[error("Export of {rows} rows exceeds the ceiling of {ceiling} rows")]
    ExportTooLarge { rows: u64, ceiling: u64 },
    #[error("Query exceeded the time limit of {0:?}")]
    QueryTimeout(Duration),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Export output failed: {0}")]
    Output(String),
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("No query tree node at path {0:?}")]
    InvalidPath(Vec<usize>),
    #[error("Catalog error: {0}")]
    Catalog(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    /// Errors detected before the store is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownField(_)
                | Self::OperatorTypeMismatch { .. }
                | Self::EmptyValue { .. }
                | Self::LimitExceeded { .. }
                | Self::InvalidPagination(_)
                | Self::Malformed(_)
                | Self::InvalidPath(_)
        )
    }

    /// Stable machine-readable code, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownField(_) => "unknown_field",
            Self::OperatorTypeMismatch { .. } => "operator_type_mismatch",
            Self::EmptyValue { .. } => "empty_value",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::InvalidPagination(_) => "invalid_pagination",
            Self::ExportTooLarge { .. } => "export_too_large",
            Self::QueryTimeout(_) => "query_timeout",
            Self::Store(_) => "store_error",
            Self::Cancelled => "cancelled",
            Self::Output(_) => "output_error",
            Self::Malformed(_) => "malformed_request",
            Self::InvalidPath(_) => "invalid_path",
            Self::Catalog(_) => "catalog_error",
            Self::Config(_) => "config_error",
            Self::Invariant(_) => "internal_error",
            Self::Lock(_) => "internal_error",
        }
    }

    /// Message shown to the end user. Store and internal failures never carry driver text.
    pub fn user_message(&self) -> String {
        match self {
            Self::QueryTimeout(limit) => format!(
                "The query took longer than {} seconds. Try narrowing it with more specific rules.",
                limit.as_secs()
            ),
            Self::ExportTooLarge { rows, ceiling } => format!(
                "The query matches {rows} sources but at most {ceiling} can be exported at once. Narrow the query and try again."
            ),
            Self::Store(_) => "The data store could not answer the query.".to_string(),
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::Output(_) => "The export could not be written.".to_string(),
            Self::Catalog(_) | Self::Config(_) | Self::Invariant(_) | Self::Lock(_) => {
                "Internal server error.".to_string()
            }
            other => other.to_string(),
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for PortalError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<std::io::Error> for PortalError {
    fn from(e: std::io::Error) -> Self {
        Self::Output(e.to_string())
    }
}

impl From<csv::Error> for PortalError {
    fn from(e: csv::Error) -> Self {
        Self::Output(e.to_string())
    }
}

impl From<::config::ConfigError> for PortalError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_hide_driver_text() {
        let err = PortalError::Store("no such table: source_agn".into());
        assert!(!err.user_message().contains("source_agn"));
        assert_eq!(err.kind(), "store_error");
        assert!(!err.is_validation());
    }

    #[test]
    fn validation_errors_are_flagged() {
        let err = PortalError::EmptyValue { field: "ra".into(), operator: "equals".into() };
        assert!(err.is_validation());
        assert!(err.user_message().contains("requires a value"));
    }
}
