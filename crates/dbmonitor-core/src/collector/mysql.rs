//! sqlx-backed processlist source.

use futures::future::BoxFuture;
use sqlx::Row;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};

use super::sampler::{ProcessListRow, ProcessListSource, RowSet, SourceError};
use crate::registry::{
    ConnectionDescriptor, Connector, PoolTuning, RegistryError, SourceHandle,
};

/// Lists current sessions. Numeric columns are cast so every column decodes as text.
pub const PROCESSLIST_QUERY: &str = r#"
    SELECT
        CAST(ID AS CHAR) AS id,
        USER AS user,
        HOST AS host,
        DB AS db,
        COMMAND AS command,
        CAST(TIME AS CHAR) AS time,
        STATE AS state,
        INFO AS info
    FROM information_schema.PROCESSLIST
"#;

/// Pool size used when `maxOpenConns` is not positive.
const DEFAULT_MAX_OPEN_CONNS: u32 = 10;

/// One instance's lazily-connecting pool.
pub struct MySqlProcessList {
    pool: MySqlPool,
}

impl MySqlProcessList {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

impl ProcessListSource for MySqlProcessList {
    fn fetch_processlist(&self) -> BoxFuture<'_, Result<RowSet, SourceError>> {
        Box::pin(async move {
            let rows = sqlx::query(PROCESSLIST_QUERY)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SourceError::Query(format_mysql_error(&e)))?;
            Ok(rows.iter().map(decode_row).collect())
        })
    }
}

fn decode_row(row: &MySqlRow) -> Result<ProcessListRow, SourceError> {
    let column = |name: &str| -> Result<Option<String>, SourceError> {
        row.try_get::<Option<String>, _>(name)
            .map_err(|e| SourceError::Decode(format!("column {}: {}", name, e)))
    };

    Ok(ProcessListRow {
        id: column("id")?,
        user: column("user")?,
        host: column("host")?,
        db: column("db")?,
        command: column("command")?,
        time: column("time")?,
        state: column("state")?,
        info: column("info")?,
    })
}

/// Opens sqlx MySQL pools without connecting.
///
/// Must be called from within a Tokio runtime: the pool spawns its
/// maintenance task on creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }

    /// Translates a descriptor into sqlx connect options.
    pub fn connect_options(
        descriptor: &ConnectionDescriptor,
    ) -> Result<MySqlConnectOptions, RegistryError> {
        let options = match descriptor.protocol.as_str() {
            "tcp" => MySqlConnectOptions::new()
                .host(&descriptor.host)
                .port(descriptor.port_number()?),
            "unix" => MySqlConnectOptions::new().socket(&descriptor.host),
            other => return Err(RegistryError::UnsupportedProtocol(other.to_string())),
        };

        let options = options
            .username(&descriptor.user)
            .password(&descriptor.password);

        Ok(if descriptor.schema.is_empty() {
            options
        } else {
            options.database(&descriptor.schema)
        })
    }

    /// Translates configured tuning into sqlx pool options.
    pub fn pool_options(tuning: &PoolTuning) -> MySqlPoolOptions {
        let max_open = u32::try_from(tuning.max_open_conns)
            .ok()
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_OPEN_CONNS);
        let min_idle = u32::try_from(tuning.max_idle_conns)
            .unwrap_or(0)
            .min(max_open);

        MySqlPoolOptions::new()
            .max_connections(max_open)
            .min_connections(min_idle)
            .max_lifetime(tuning.conn_max_lifetime)
            .test_before_acquire(false)
    }
}

impl Connector for MySqlConnector {
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        tuning: &PoolTuning,
    ) -> Result<SourceHandle, RegistryError> {
        let options = Self::connect_options(descriptor)?;
        let pool = Self::pool_options(tuning).connect_lazy_with(options);
        Ok(std::sync::Arc::new(MySqlProcessList::new(pool)))
    }
}

/// Formats sqlx errors for logging.
fn format_mysql_error(e: &sqlx::Error) -> String {
    match e {
        sqlx::Error::Database(db_error) => match db_error.code() {
            Some(code) => format!("{} ({})", db_error.message(), code),
            None => db_error.message().to_string(),
        },
        sqlx::Error::PoolTimedOut => "timed out acquiring connection".to_string(),
        sqlx::Error::Io(io) => format!("connection error: {}", io),
        other => other.to_string(),
    }
}
