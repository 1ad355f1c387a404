//! Processlist sampling and row normalization.

use std::fmt;
use std::num::IntErrorKind;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

/// One raw processlist row. Every column may be NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessListRow {
    pub id: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub db: Option<String>,
    pub command: Option<String>,
    pub time: Option<String>,
    pub state: Option<String>,
    /// Read to keep the eight-column row shape; never emitted.
    pub info: Option<String>,
}

/// Error reported by a [`ProcessListSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Statement failed as a whole (connection, permission, syntax).
    Query(String),
    /// A single row could not be decoded.
    Decode(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Query(msg) => write!(f, "query failed: {}", msg),
            SourceError::Decode(msg) => write!(f, "row decode failed: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Rows of one processlist query; each row decodes independently.
pub type RowSet = Vec<Result<ProcessListRow, SourceError>>;

/// Something that can list the sessions of one instance.
pub trait ProcessListSource: Send + Sync {
    /// Runs the processlist query once.
    fn fetch_processlist(&self) -> BoxFuture<'_, Result<RowSet, SourceError>>;
}

/// Error type for sampling one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    Query { instance: String, message: String },
    Timeout { instance: String, timeout: Duration },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Query { instance, message } => {
                write!(f, "{}: {}", instance, message)
            }
            SampleError::Timeout { instance, timeout } => {
                write!(f, "{}: processlist query timed out after {:?}", instance, timeout)
            }
        }
    }
}

impl std::error::Error for SampleError {}

/// One session, with NULLs replaced by empty strings and elapsed time parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub user: String,
    /// As reported by the server, possibly `addr:port`.
    pub host: String,
    pub database: String,
    pub command: String,
    pub elapsed_seconds: i64,
    pub state: String,
}

impl SessionRecord {
    pub fn from_row(row: ProcessListRow) -> Self {
        let elapsed_seconds = parse_elapsed(row.time.as_deref().unwrap_or_default());
        Self {
            id: row.id.unwrap_or_default(),
            user: row.user.unwrap_or_default(),
            host: row.host.unwrap_or_default(),
            database: row.db.unwrap_or_default(),
            command: row.command.unwrap_or_default(),
            elapsed_seconds,
            state: row.state.unwrap_or_default(),
        }
    }

    /// Host with any `:port` suffix removed.
    pub fn host_without_port(&self) -> &str {
        strip_port(&self.host)
    }
}

/// Drops everything from the last colon on.
///
/// A value without a colon, or whose only colon is the first character,
/// is returned unchanged.
pub fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if idx > 0 => &host[..idx],
        _ => host,
    }
}

/// Parses the processlist `Time` column.
///
/// Out of range values saturate at the `i64` bounds. Anything else that is
/// not an integer is 0.
pub fn parse_elapsed(time: &str) -> i64 {
    match time.parse::<i64>() {
        Ok(seconds) => seconds,
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => i64::MAX,
            IntErrorKind::NegOverflow => i64::MIN,
            _ => 0,
        },
    }
}

/// Runs the processlist query against one instance with a time bound.
#[derive(Debug, Clone, Copy)]
pub struct SessionSampler {
    timeout: Duration,
}

impl SessionSampler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Samples one instance.
    ///
    /// Rows that fail to decode are logged and skipped. A failed or timed out
    /// query yields an error and no records.
    pub async fn sample(
        &self,
        instance: &str,
        source: &dyn ProcessListSource,
    ) -> Result<Vec<SessionRecord>, SampleError> {
        let rows = match tokio::time::timeout(self.timeout, source.fetch_processlist()).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                return Err(SampleError::Query {
                    instance: instance.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SampleError::Timeout {
                    instance: instance.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let records = rows
            .into_iter()
            .filter_map(|row| match row {
                Ok(row) => Some(SessionRecord::from_row(row)),
                Err(e) => {
                    warn!(instance, error = %e, "skipping processlist row");
                    None
                }
            })
            .collect();

        Ok(records)
    }
}
