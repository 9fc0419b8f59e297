//! Expression verification against a staging database.
//!
//! Generated CHECK constraints, column defaults and generated-column
//! expressions are each probed with one validating query before cutover.
//! Probes run through the task runner with bounded parallelism and
//! `continue_on_error`, so one bad expression never hides the others.

mod types;

pub use types::{ExpressionDetail, ExpressionKind, ExpressionResult, VerificationReport};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::{debug, info, warn};

use crate::config::{TargetConfig, VerifyConfig};
use crate::error::{MigrateError, Result};
use crate::target::build_pool;
use crate::task::{run_parallel_tasks, SharedGuard, TaskResult};

/// Runs probe queries for the verifier.
#[async_trait]
pub trait ExpressionBackend: Send + Sync {
    /// Execute one probe; `Err` means the expression is invalid on the target.
    async fn probe(&self, sql: &str) -> Result<()>;

    /// Whether probes must not overlap, e.g. because they share one connection.
    fn requires_serialization(&self) -> bool {
        false
    }
}

/// Probes against PostgreSQL through a deadpool pool.
pub struct PgExpressionBackend {
    pool: Pool,
}

impl PgExpressionBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a dedicated pool against the staging database and check it answers.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let backend = Self::new(build_pool(config, max_conns)?);
        backend.probe("SELECT 1").await?;
        info!(
            "Connected to staging database {}:{}/{} for expression checks",
            config.host, config.port, config.database
        );
        Ok(backend)
    }
}

#[async_trait]
impl ExpressionBackend for PgExpressionBackend {
    async fn probe(&self, sql: &str) -> Result<()> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "expression probe"))?;

        // Extended protocol: one statement only, in a read-only transaction
        // that is rolled back when dropped
        let tx = client.transaction().await.map_err(probe_error)?;
        tx.batch_execute("SET TRANSACTION READ ONLY")
            .await
            .map_err(probe_error)?;
        tx.query(sql, &[]).await.map_err(probe_error)?;
        Ok(())
    }

    fn requires_serialization(&self) -> bool {
        // A single-connection pool would make overlapping probes queue on checkout
        self.pool.status().max_size <= 1
    }
}

fn probe_error(e: tokio_postgres::Error) -> MigrateError {
    match e.as_db_error() {
        Some(db) => MigrateError::Verification(db.message().to_string()),
        None => MigrateError::Target(e),
    }
}

/// Reject an expression that would end the probe statement early.
///
/// A `;` is allowed only inside a string literal or a quoted identifier.
pub fn check_single_expression(expression: &str) -> Result<()> {
    let mut quote: Option<char> = None;
    for c in expression.chars() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(open), _) if c == open => quote = None,
            (None, ';') => {
                return Err(MigrateError::Verification(
                    "expression contains multiple statements".to_string(),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build the validating query for one expression.
///
/// Queries use `LIMIT 0` where a table is involved, so the server parses,
/// resolves and type-checks the expression without reading rows.
pub fn probe_sql(detail: &ExpressionDetail, schema: &str) -> String {
    let table = format!("{}.{}", quote_ident(schema), quote_ident(&detail.table));
    match detail.kind {
        ExpressionKind::Check => {
            format!("SELECT ({})::boolean FROM {} LIMIT 0", detail.expression, table)
        }
        ExpressionKind::Default => match &detail.data_type {
            Some(data_type) => format!("SELECT CAST(({}) AS {})", detail.expression, data_type),
            None => format!("SELECT ({})", detail.expression),
        },
        ExpressionKind::Generic => {
            format!("SELECT ({}) FROM {} LIMIT 0", detail.expression, table)
        }
    }
}

/// Probe every expression and collect a report in input order.
pub async fn verify_expressions(
    backend: Arc<dyn ExpressionBackend>,
    details: Vec<ExpressionDetail>,
    schema: &str,
    config: &VerifyConfig,
) -> VerificationReport {
    let start = Instant::now();
    let total = details.len();
    info!(
        "Verifying {} expressions (concurrency: {}, continue_on_error: {})",
        total, config.concurrency, config.continue_on_error
    );

    let items: Vec<(Arc<dyn ExpressionBackend>, ExpressionDetail)> = details
        .iter()
        .cloned()
        .map(|detail| (backend.clone(), detail))
        .collect();
    let schema = schema.to_string();

    let outcome = run_parallel_tasks(
        items,
        config.concurrency,
        move |(backend, detail): (Arc<dyn ExpressionBackend>, ExpressionDetail),
              guard: SharedGuard| {
            let sql = check_single_expression(&detail.expression)
                .map(|()| probe_sql(&detail, &schema));
            async move {
                match sql {
                    Ok(sql) => probe_one(backend, detail, sql, guard).await,
                    Err(e) => {
                        debug!("Expression {} ({}) rejected: {}", detail.id, detail.kind, e);
                        TaskResult::err(e)
                    }
                }
            }
        },
        config.continue_on_error,
    )
    .await;

    let mut report = VerificationReport {
        stopped_early: outcome.error.as_ref().map(|e| e.to_string()),
        ..Default::default()
    };

    for (detail, slot) in details.into_iter().zip(outcome.results) {
        let entry = match slot {
            Some(task) => {
                let duration_ms = task.result.unwrap_or(0);
                match task.err {
                    None => {
                        report.passed += 1;
                        result_for(detail, Some(true), None, duration_ms)
                    }
                    Some(e) => {
                        report.failed += 1;
                        result_for(detail, Some(false), Some(e.to_string()), duration_ms)
                    }
                }
            }
            None => {
                report.skipped += 1;
                result_for(detail, None, None, 0)
            }
        };
        report.results.push(entry);
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    if report.failed > 0 {
        warn!(
            "Expression verification: {} passed, {} failed, {} skipped",
            report.passed, report.failed, report.skipped
        );
    } else {
        info!(
            "Expression verification: {} passed, {} skipped in {}ms",
            report.passed, report.skipped, report.duration_ms
        );
    }
    report
}

/// Worker body: returns elapsed milliseconds as the result, plus any probe error.
async fn probe_one(
    backend: Arc<dyn ExpressionBackend>,
    detail: ExpressionDetail,
    sql: String,
    guard: SharedGuard,
) -> TaskResult<u64> {
    let start = Instant::now();

    let probed = if backend.requires_serialization() {
        let _lock = guard.lock().await;
        backend.probe(&sql).await
    } else {
        backend.probe(&sql).await
    };

    let elapsed = start.elapsed().as_millis() as u64;
    match probed {
        Ok(()) => {
            debug!("Expression {} ({}) ok in {}ms", detail.id, detail.kind, elapsed);
            TaskResult::ok(elapsed)
        }
        Err(e) => {
            debug!("Expression {} ({}) failed: {}", detail.id, detail.kind, e);
            TaskResult::partial(elapsed, e)
        }
    }
}

fn result_for(
    detail: ExpressionDetail,
    passed: Option<bool>,
    error: Option<String>,
    duration_ms: u64,
) -> ExpressionResult {
    ExpressionResult {
        id: detail.id,
        kind: detail.kind,
        table: detail.table,
        column: detail.column,
        passed,
        error,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn detail(id: &str, kind: ExpressionKind, expression: &str) -> ExpressionDetail {
        ExpressionDetail {
            id: id.to_string(),
            kind,
            table: "orders".to_string(),
            column: Some("total".to_string()),
            expression: expression.to_string(),
            data_type: None,
        }
    }

    /// Rejects any probe mentioning `bad`; tracks how many probes overlap.
    struct MockBackend {
        serialize: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockBackend {
        fn new(serialize: bool) -> Self {
            Self {
                serialize,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExpressionBackend for MockBackend {
        async fn probe(&self, sql: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if sql.contains("bad") {
                Err(MigrateError::Verification(
                    "column \"bad\" does not exist".to_string(),
                ))
            } else {
                Ok(())
            }
        }

        fn requires_serialization(&self) -> bool {
            self.serialize
        }
    }

    #[test]
    fn test_probe_sql_per_kind() {
        let check = detail("c1", ExpressionKind::Check, "total >= 0");
        assert_eq!(
            probe_sql(&check, "public"),
            "SELECT (total >= 0)::boolean FROM \"public\".\"orders\" LIMIT 0"
        );

        let mut default = detail("d1", ExpressionKind::Default, "now()");
        assert_eq!(probe_sql(&default, "public"), "SELECT (now())");
        default.data_type = Some("timestamptz".to_string());
        assert_eq!(
            probe_sql(&default, "public"),
            "SELECT CAST((now()) AS timestamptz)"
        );

        let generic = detail("g1", ExpressionKind::Generic, "price * qty");
        assert_eq!(
            probe_sql(&generic, "sales"),
            "SELECT (price * qty) FROM \"sales\".\"orders\" LIMIT 0"
        );
    }

    #[test]
    fn test_check_single_expression() {
        assert!(check_single_expression("total >= 0").is_ok());
        assert!(check_single_expression("note <> 'a;b'").is_ok());
        assert!(check_single_expression("\"odd;name\" IS NOT NULL").is_ok());
        assert!(check_single_expression("note <> 'it''s; fine'").is_ok());
        assert!(check_single_expression("1) FROM x; DROP TABLE orders; SELECT (1").is_err());
        assert!(check_single_expression("now();").is_err());
    }

    #[tokio::test]
    async fn test_multi_statement_expression_is_never_sent() {
        let backend = Arc::new(MockBackend::new(false));
        let details = vec![
            detail("1", ExpressionKind::Generic, "1) FROM x; DROP TABLE orders; SELECT (1"),
            detail("2", ExpressionKind::Check, "total >= 0"),
        ];

        let report = verify_expressions(
            backend.clone(),
            details,
            "public",
            &VerifyConfig::default(),
        )
        .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.passed, 1);
        assert_eq!(report.results[0].passed, Some(false));
        assert!(report.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("multiple statements"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failures_do_not_hide_others() {
        let backend = Arc::new(MockBackend::new(false));
        let details = vec![
            detail("1", ExpressionKind::Check, "total >= 0"),
            detail("2", ExpressionKind::Check, "bad > 0"),
            detail("3", ExpressionKind::Generic, "total * 2"),
            detail("4", ExpressionKind::Default, "bad()"),
        ];

        let report =
            verify_expressions(backend, details, "public", &VerifyConfig::default()).await;

        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.skipped, 0);
        assert!(report.stopped_early.is_none());
        let ids: Vec<&str> = report.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(report.results[1].passed, Some(false));
        assert!(report.results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("does not exist"));
        assert_eq!(report.failures().count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serialized_backend_never_overlaps() {
        let backend = Arc::new(MockBackend::new(true));
        let details: Vec<ExpressionDetail> = (0..20)
            .map(|i| detail(&i.to_string(), ExpressionKind::Check, "total >= 0"))
            .collect();

        let report = verify_expressions(
            backend.clone(),
            details,
            "public",
            &VerifyConfig::default(),
        )
        .await;

        assert_eq!(report.passed, 20);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_reports_stop() {
        let backend = Arc::new(MockBackend::new(false));
        let details = vec![
            detail("1", ExpressionKind::Check, "bad"),
            detail("2", ExpressionKind::Check, "ok"),
            detail("3", ExpressionKind::Check, "ok"),
        ];
        let config = VerifyConfig {
            concurrency: 1,
            continue_on_error: false,
        };

        let report = verify_expressions(backend, details, "public", &config).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 2);
        assert!(report.stopped_early.is_some());
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let backend = Arc::new(MockBackend::new(false));
        let report =
            verify_expressions(backend, Vec::new(), "public", &VerifyConfig::default()).await;
        assert!(report.results.is_empty());
        assert!(report.is_success());
    }
}
