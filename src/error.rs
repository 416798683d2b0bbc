use rusqlite::ErrorCode;
use thiserror::Error;

/// SQLSTATE codes reported to clients.
///
/// Only the classes the bridge actually produces are listed; see the
/// PostgreSQL "Errcodes" appendix for the full table.
pub mod sqlstate {
    pub const SUCCESSFUL_COMPLETION: &str = "00000";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const CONNECTION_EXCEPTION: &str = "08000";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const DATA_EXCEPTION: &str = "22000";
    pub const INVALID_PARAMETER_VALUE: &str = "22023";
    pub const CHARACTER_NOT_IN_REPERTOIRE: &str = "22021";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    pub const INVALID_BINARY_REPRESENTATION: &str = "22P03";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const DATETIME_FIELD_OVERFLOW: &str = "22008";
    pub const INTEGRITY_CONSTRAINT_VIOLATION: &str = "23000";
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const INVALID_TRANSACTION_STATE: &str = "25000";
    pub const ACTIVE_SQL_TRANSACTION: &str = "25001";
    pub const NO_ACTIVE_SQL_TRANSACTION: &str = "25P01";
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
    pub const READ_ONLY_SQL_TRANSACTION: &str = "25006";
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
    pub const INVALID_SAVEPOINT_SPECIFICATION: &str = "3B001";
    pub const INVALID_CURSOR_NAME: &str = "34000";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const UNDEFINED_FUNCTION: &str = "42883";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_OBJECT: &str = "42704";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const INDETERMINATE_DATATYPE: &str = "42P18";
    pub const TOO_MANY_CONNECTIONS: &str = "53300";
    pub const CANT_CHANGE_RUNTIME_PARAM: &str = "55P02";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const INTERNAL_ERROR: &str = "XX000";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// A statement-level error as PostgreSQL clients see it.
///
/// Everything that reaches the client goes through this type, whether it came
/// from translation, type coercion, or SQLite itself. The protocol layer turns
/// it into an `ErrorResponse`.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct PgError {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl PgError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            ..Self::new(code, message)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(sqlstate::SYNTAX_ERROR, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(sqlstate::FEATURE_NOT_SUPPORTED, message)
    }

    pub fn invalid_text(type_name: &str, input: &str) -> Self {
        Self::new(
            sqlstate::INVALID_TEXT_REPRESENTATION,
            format!("invalid input syntax for type {type_name}: \"{input}\""),
        )
    }

    pub fn invalid_binary(type_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            sqlstate::INVALID_BINARY_REPRESENTATION,
            format!("incorrect binary data format for type {type_name}: {reason}"),
        )
    }

    pub fn out_of_range(type_name: &str) -> Self {
        Self::new(
            sqlstate::NUMERIC_VALUE_OUT_OF_RANGE,
            format!("value out of range for type {type_name}"),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(sqlstate::PROTOCOL_VIOLATION, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(sqlstate::INTERNAL_ERROR, message)
    }

    pub fn aborted_transaction() -> Self {
        Self::new(
            sqlstate::IN_FAILED_SQL_TRANSACTION,
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    /// True for errors a client may reasonably retry unchanged.
    pub fn is_retryable(&self) -> bool {
        self.code == sqlstate::LOCK_NOT_AVAILABLE
    }
}

impl From<rusqlite::Error> for PgError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, msg) => {
                let message = msg.clone().unwrap_or_else(|| failure.to_string());
                let code = match failure.extended_code {
                    // SQLITE_CONSTRAINT_UNIQUE, SQLITE_CONSTRAINT_PRIMARYKEY
                    2067 | 1555 => sqlstate::UNIQUE_VIOLATION,
                    // SQLITE_CONSTRAINT_NOTNULL
                    1299 => sqlstate::NOT_NULL_VIOLATION,
                    // SQLITE_CONSTRAINT_FOREIGNKEY
                    787 => sqlstate::FOREIGN_KEY_VIOLATION,
                    // SQLITE_CONSTRAINT_CHECK
                    275 => sqlstate::CHECK_VIOLATION,
                    _ => match failure.code {
                        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                            sqlstate::LOCK_NOT_AVAILABLE
                        }
                        ErrorCode::ConstraintViolation => sqlstate::INTEGRITY_CONSTRAINT_VIOLATION,
                        ErrorCode::ReadOnly => sqlstate::READ_ONLY_SQL_TRANSACTION,
                        _ => classify_engine_message(&message),
                    },
                };
                let mut pg = PgError::new(code, message);
                if code == sqlstate::LOCK_NOT_AVAILABLE {
                    pg = pg.with_hint("another session holds the write lock; retry the transaction");
                }
                pg
            }
            rusqlite::Error::InvalidParameterCount(given, expected) => PgError::protocol(format!(
                "bind message supplies {given} parameters, but prepared statement requires {expected}"
            )),
            other => PgError::internal(other.to_string()),
        }
    }
}

fn classify_engine_message(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.starts_with("no such table") {
        sqlstate::UNDEFINED_TABLE
    } else if lower.starts_with("no such column") {
        sqlstate::UNDEFINED_COLUMN
    } else if lower.starts_with("no such function") {
        sqlstate::UNDEFINED_FUNCTION
    } else if lower.contains("syntax error") || lower.starts_with("near \"") {
        sqlstate::SYNTAX_ERROR
    } else if lower.contains("already exists") {
        sqlstate::DUPLICATE_TABLE
    } else if lower.contains("cannot start a transaction within a transaction") {
        sqlstate::ACTIVE_SQL_TRANSACTION
    } else if lower.contains("no transaction is active") {
        sqlstate::NO_ACTIVE_SQL_TRANSACTION
    } else {
        sqlstate::INTERNAL_ERROR
    }
}

/// Connection-fatal framing errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message tag {0:?}")]
    UnknownTag(char),
    #[error("message of {0} bytes exceeds the maximum frame size")]
    TooLarge(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

impl From<ProtocolError> for PgError {
    fn from(err: ProtocolError) -> Self {
        PgError::fatal(sqlstate::PROTOCOL_VIOLATION, err.to_string())
    }
}

pub type PgResult<T> = Result<T, PgError>;
