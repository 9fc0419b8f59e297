//! PostgreSQL implementation of [`MutationWriter`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::core::{Batch, Mutation, SqlValue};
use crate::error::{MigrateError, Result, WriteError};

use super::MutationWriter;

/// Upper bound on rows in a single multi-row INSERT statement.
pub const MAX_ROWS_PER_STATEMENT: usize = 1_000;

/// Writes batches to PostgreSQL, one transaction per batch.
pub struct PgMutationWriter {
    pool: Pool,
    schema: String,
    name: String,
}

impl PgMutationWriter {
    /// Build the connection pool and check that the target answers.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let pool = build_pool(config, max_conns)?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "connecting to target"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (pool size {})",
            config.host, config.port, config.database, max_conns
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
            name: format!("postgres://{}:{}/{}", config.host, config.port, config.database),
        })
    }

    /// The underlying pool, shared with other target-side work.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Round-trip a trivial query and report its latency.
    pub async fn health_check(&self) -> Result<Duration> {
        let start = Instant::now();
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "health check"))?;
        client.simple_query("SELECT 1").await?;
        Ok(start.elapsed())
    }

    async fn write_batch(&self, batch: &Batch) -> std::result::Result<(), WriteError> {
        let statements = build_batch_statements(&self.schema, batch.mutations());
        if statements.is_empty() {
            return Ok(());
        }

        let mut client = self.pool.get().await.map_err(classify_pool_error)?;
        let tx = client.transaction().await.map_err(classify_pg_error)?;

        for sql in &statements {
            tx.batch_execute(sql).await.map_err(classify_pg_error)?;
        }

        tx.commit().await.map_err(classify_pg_error)?;

        debug!(
            "Batch {}: {} rows in {} statement(s)",
            batch.id(),
            batch.row_count(),
            statements.len()
        );
        Ok(())
    }
}

#[async_trait]
impl MutationWriter for PgMutationWriter {
    async fn write(&self, batch: &Batch) -> std::result::Result<(), WriteError> {
        self.write_batch(batch).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Create a deadpool pool for the target without connecting.
pub(crate) fn build_pool(config: &TargetConfig, max_conns: usize) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);
    pg_config.application_name("bulk-migrate");

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    Pool::builder(mgr)
        .max_size(max_conns.max(1))
        .build()
        .map_err(|e| MigrateError::pool(e.to_string(), "creating target pool"))
}

/// SQLSTATEs that describe a busy or restarting server rather than bad data.
fn is_transient_state(code: &SqlState) -> bool {
    *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::TOO_MANY_CONNECTIONS
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::LOCK_NOT_AVAILABLE
}

fn classify_pg_error(e: tokio_postgres::Error) -> WriteError {
    let transient = match e.code() {
        Some(code) => is_transient_state(code),
        // No SQLSTATE means the failure happened below the protocol
        None => {
            e.is_closed()
                || std::error::Error::source(&e)
                    .map(|s| s.is::<std::io::Error>())
                    .unwrap_or(false)
        }
    };

    let message = match e.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => e.to_string(),
    };

    if transient {
        WriteError::transient(message)
    } else {
        WriteError::permanent(message)
    }
}

fn classify_pool_error(e: PoolError) -> WriteError {
    match e {
        PoolError::Backend(pg) => classify_pg_error(pg),
        other => WriteError::transient(format!("connection pool: {}", other)),
    }
}

/// Quote a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Escape a string for SQL literal use.
fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

fn float_literal(n: f64, cast: &str) -> String {
    if n.is_finite() {
        n.to_string()
    } else if n.is_nan() {
        format!("'NaN'::{}", cast)
    } else if n > 0.0 {
        format!("'Infinity'::{}", cast)
    } else {
        format!("'-Infinity'::{}", cast)
    }
}

/// Convert SqlValue to SQL literal string.
fn sql_value_to_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null(_) => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(n) => float_literal(f64::from(*n), "float4"),
        SqlValue::F64(n) => float_literal(*n, "float8"),
        SqlValue::Text(s) => format!("'{}'", escape_sql_string(s)),
        SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
        SqlValue::Uuid(u) => format!("'{}'::uuid", u),
        SqlValue::Decimal(d) => format!("{}::numeric", d),
        SqlValue::DateTime(dt) => format!("'{}'::timestamp", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
        SqlValue::DateTimeOffset(dt) => format!("'{}'::timestamptz", dt.to_rfc3339()),
        SqlValue::Date(d) => format!("'{}'::date", d),
        SqlValue::Time(t) => format!("'{}'::time", t),
    }
}

/// Build a multi-row INSERT with literal values.
fn build_insert_sql_literals(schema: &str, table: &str, cols: &[String], rows: &[&Mutation]) -> String {
    let col_list: String = cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let value_rows: Vec<String> = rows
        .iter()
        .map(|m| {
            let values: Vec<String> = m.values().iter().map(sql_value_to_literal).collect();
            format!("({})", values.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualify_table(schema, table),
        col_list,
        value_rows.join(", ")
    )
}

/// Group consecutive mutations with the same table and column list into
/// INSERT statements, preserving batch order.
fn build_batch_statements(schema: &str, mutations: &[Mutation]) -> Vec<String> {
    let mut statements = Vec::new();
    let mut group: Vec<&Mutation> = Vec::new();

    for m in mutations {
        let same_shape = group
            .first()
            .map(|head| head.table() == m.table() && head.columns() == m.columns())
            .unwrap_or(true);

        if !same_shape || group.len() >= MAX_ROWS_PER_STATEMENT {
            statements.push(insert_for_group(schema, &group));
            group.clear();
        }
        group.push(m);
    }

    if !group.is_empty() {
        statements.push(insert_for_group(schema, &group));
    }
    statements
}

fn insert_for_group(schema: &str, group: &[&Mutation]) -> String {
    let head = group[0];
    build_insert_sql_literals(schema, head.table(), head.columns(), group)
}
