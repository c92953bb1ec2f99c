use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    NotFound,
    InvalidArgument,
    Internal,
    InvalidState,
    DuplicateKey,
    NotNullViolation,
    ForeignKeyViolation,
    ScopeViolation,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    /// Unique index already holds `key` for another row.
    pub fn duplicate_key(index: &str, key: impl fmt::Debug) -> Self {
        Error::new(
            ErrorKind::DuplicateKey,
            format!("index {}: duplicate key {:?}", index, key),
        )
    }

    pub fn not_null(table: &str, column: &str) -> Self {
        Error::new(
            ErrorKind::NotNullViolation,
            format!("{}.{} must not be null", table, column),
        )
    }

    pub fn foreign_key(constraint: &str, detail: String) -> Self {
        Error::new(
            ErrorKind::ForeignKeyViolation,
            format!("foreign key {}: {}", constraint, detail),
        )
    }

    pub fn out_of_scope(table: &str) -> Self {
        Error::new(
            ErrorKind::ScopeViolation,
            format!("table {} is not in the transaction scope", table),
        )
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, context.into())
    }

    pub fn invalid_argument(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, context.into())
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, context.into())
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, context.into())
    }

    /// True for the schema-violation family (unique, not-null, foreign key).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::DuplicateKey | ErrorKind::NotNullViolation | ErrorKind::ForeignKeyViolation
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: format!("JSON error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
