//! Error types and the normalizer that turns every engine's native error
//! into a positioned [`SqlError`].

use std::fmt;
use std::sync::Arc;

use crate::analysis::Node;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("configuration: {0}")]
    Config(String),

    #[error("database: connections disabled via DBPROBE_DEBUG=databases=managed")]
    ManagedOnly,

    #[error("provision {database}: {message}")]
    Provision { database: String, message: String },

    #[error("connection: {0}")]
    Connection(String),

    #[error("invalid checksum: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("sandbox: {0}")]
    Sandbox(String),

    #[error("{0} is not supported by this analyzer")]
    Unsupported(&'static str),

    #[error("database connection not initialized")]
    NotConnected,

    #[error("in-flight call for {0} was aborted")]
    Aborted(String),

    #[error(transparent)]
    Shared(#[from] Arc<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn provision(database: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Provision {
            database: database.into(),
            message: message.to_string(),
        }
    }

    /// The positioned SQL error, looking through shared wrappers.
    pub fn as_sql(&self) -> Option<&SqlError> {
        match self {
            Error::Sql(e) => Some(e),
            Error::Shared(e) => e.as_sql(),
            _ => None,
        }
    }

    /// Whether the error means the connection itself is unusable.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Sql(e) => e.category() == ErrorCategory::Connection,
            Error::Shared(e) => e.is_connection(),
            _ => false,
        }
    }
}

/// Coarse class of an engine error, derived from its SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Syntax,
    /// Unknown relation, column, function or type
    Semantic,
    Execution,
    Transaction,
    /// The server dropped or refused the session
    Connection,
    Unknown,
}

impl ErrorCategory {
    /// Classifies a five-character SQLSTATE. Vendor codes that are not
    /// SQLSTATEs (MySQL numbers, SQLite result codes) stay `Unknown`.
    pub fn from_sqlstate(code: &str) -> Self {
        if code.len() != 5 || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return ErrorCategory::Unknown;
        }
        match (&code[..2], code) {
            (_, "42601" | "42000") => ErrorCategory::Syntax,
            ("42", _) => ErrorCategory::Semantic,
            ("08", _) => ErrorCategory::Connection,
            // admin_shutdown, crash_shutdown, cannot_connect_now
            (_, "57P01" | "57P02" | "57P03") => ErrorCategory::Connection,
            ("25" | "40", _) => ErrorCategory::Transaction,
            ("22" | "23" | "53" | "54" | "55" | "57", _) => ErrorCategory::Execution,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Semantic => "semantic",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Transaction => "transaction",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Unknown => "database",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine error positioned within the original statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    /// Engine error code (SQLSTATE, vendor number), empty when unknown
    pub code: String,
    pub message: String,
    /// Byte offset within the source file that holds the statement
    pub location: usize,
}

impl SqlError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, location: usize) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            location,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_sqlstate(&self.code)
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for SqlError {}

/// Translates an engine-relative error position into a source offset.
///
/// `base` is the position the engine uses for the first character of the
/// statement (1 for PostgreSQL, 0 for zero-based engines). The result never
/// lies before the statement itself.
pub fn locate(node_pos: usize, engine_pos: Option<usize>, base: usize) -> usize {
    match engine_pos {
        Some(pos) => (node_pos + pos).saturating_sub(base).max(node_pos),
        None => node_pos,
    }
}

/// Normalizes a PostgreSQL error. Non-database errors are transport failures.
pub fn from_postgres(node: &dyn Node, err: &tokio_postgres::Error) -> Error {
    match err.as_db_error() {
        Some(db_err) => {
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            Error::Sql(SqlError::new(
                db_err.code().code(),
                db_err.message(),
                locate(node.pos(), position, 1),
            ))
        }
        None if err.is_closed() => Error::Connection(err.to_string()),
        None => Error::Sql(SqlError::new("", err.to_string(), node.pos())),
    }
}

pub fn from_mysql(node: &dyn Node, err: &mysql_async::Error) -> Error {
    match err {
        mysql_async::Error::Server(server) => Error::Sql(SqlError::new(
            server.code.to_string(),
            format!("mysql: {}", server.message),
            node.pos(),
        )),
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            Error::Connection(err.to_string())
        }
        other => Error::Sql(SqlError::new("", format!("mysql: {other}"), node.pos())),
    }
}

pub fn from_sqlite(node: &dyn Node, err: &rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(failure, msg) => Error::Sql(SqlError::new(
            failure.extended_code.to_string(),
            msg.clone().unwrap_or_else(|| failure.to_string()),
            node.pos(),
        )),
        other => Error::Sql(SqlError::new("", other.to_string(), node.pos())),
    }
}

pub fn from_duckdb(node: &dyn Node, err: &duckdb::Error) -> Error {
    match err {
        duckdb::Error::DuckDBFailure(failure, msg) => Error::Sql(SqlError::new(
            format!("{:?}", failure.code),
            msg.clone().unwrap_or_else(|| failure.to_string()),
            node.pos(),
        )),
        other => Error::Sql(SqlError::new("", other.to_string(), node.pos())),
    }
}

pub fn from_mssql(node: &dyn Node, err: &tiberius::error::Error) -> Error {
    match err {
        tiberius::error::Error::Server(token) => Error::Sql(SqlError::new(
            token.code().to_string(),
            token.message(),
            node.pos(),
        )),
        tiberius::error::Error::Io { .. } | tiberius::error::Error::Tls(_) => {
            Error::Connection(err.to_string())
        }
        other => Error::Sql(SqlError::new("", other.to_string(), node.pos())),
    }
}

/// Normalizes a ClickHouse HTTP error body such as
/// `Code: 62. DB::Exception: Syntax error: failed at position 8 ...`.
///
/// ClickHouse reports 1-based positions in the text it was sent. `origin`
/// maps a 0-based offset in that text back into the statement; offsets it
/// cannot map fall back to the statement start.
pub fn from_clickhouse(node: &dyn Node, body: &str, origin: &dyn Fn(usize) -> Option<usize>) -> Error {
    let body = body.trim();
    let code = body
        .strip_prefix("Code: ")
        .and_then(|rest| rest.split('.').next())
        .unwrap_or_default()
        .to_string();
    let offset = body
        .find("at position ")
        .map(|idx| &body[idx + "at position ".len()..])
        .and_then(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().ok()
        })
        .and_then(|pos| origin(pos.saturating_sub(1)));
    let location = match offset {
        Some(offset) => node.pos() + offset,
        None => node.pos(),
    };
    Error::Sql(SqlError::new(code, body, location))
}
