//! CSV row producer.
//!
//! Reads delimited text with the `csv` crate, converts each field to a typed
//! [`SqlValue`] and emits one row per record into a [`RowSink`]. Records that
//! cannot be converted are counted and skipped rather than aborting the load.

use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};
use crate::writer::RowSink;

/// Declared type of a CSV column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    Text,
    Bool,
    Int,
    BigInt,
    Float,
    Numeric,
    Date,
    Timestamp,
    Uuid,
}

impl FromStr for ColumnType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "bool" | "boolean" => Ok(ColumnType::Bool),
            "int" | "integer" | "int4" => Ok(ColumnType::Int),
            "bigint" | "int8" => Ok(ColumnType::BigInt),
            "float" | "double" | "float8" => Ok(ColumnType::Float),
            "numeric" | "decimal" => Ok(ColumnType::Numeric),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            "uuid" => Ok(ColumnType::Uuid),
            other => Err(MigrateError::Config(format!("Unknown column type '{}'", other))),
        }
    }
}

impl ColumnType {
    fn null_type(self) -> SqlNullType {
        match self {
            ColumnType::Text => SqlNullType::String,
            ColumnType::Bool => SqlNullType::Bool,
            ColumnType::Int => SqlNullType::I32,
            ColumnType::BigInt => SqlNullType::I64,
            ColumnType::Float => SqlNullType::F64,
            ColumnType::Numeric => SqlNullType::Decimal,
            ColumnType::Date => SqlNullType::Date,
            ColumnType::Timestamp => SqlNullType::DateTime,
            ColumnType::Uuid => SqlNullType::Uuid,
        }
    }

    /// Convert one raw field. Empty fields are NULL for every type but text.
    pub fn parse_value(self, raw: &str) -> std::result::Result<SqlValue, String> {
        if raw.is_empty() && self != ColumnType::Text {
            return Ok(SqlValue::Null(self.null_type()));
        }

        let trimmed = raw.trim();
        let parsed = match self {
            ColumnType::Text => return Ok(SqlValue::Text(raw.to_string())),
            ColumnType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" => Ok(SqlValue::Bool(true)),
                "false" | "f" | "0" | "no" | "n" => Ok(SqlValue::Bool(false)),
                _ => Err(()),
            },
            ColumnType::Int => trimmed.parse::<i32>().map(SqlValue::I32).map_err(|_| ()),
            ColumnType::BigInt => trimmed.parse::<i64>().map(SqlValue::I64).map_err(|_| ()),
            ColumnType::Float => trimmed.parse::<f64>().map(SqlValue::F64).map_err(|_| ()),
            ColumnType::Numeric => Decimal::from_str(trimmed)
                .or_else(|_| Decimal::from_scientific(trimmed))
                .map(SqlValue::Decimal)
                .map_err(|_| ()),
            ColumnType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(SqlValue::Date)
                .map_err(|_| ()),
            ColumnType::Timestamp => NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
                .map(SqlValue::DateTime)
                .map_err(|_| ()),
            ColumnType::Uuid => Uuid::parse_str(trimmed).map(SqlValue::Uuid).map_err(|_| ()),
        };

        parsed.map_err(|_| format!("cannot parse '{}' as {:?}", raw, self))
    }
}

/// How to read a CSV stream.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub delimiter: u8,

    /// First record names the columns.
    pub has_header: bool,

    /// Column names; required when there is no header, overrides it otherwise.
    pub columns: Option<Vec<String>>,

    /// Per-column types; unlisted columns are text.
    pub column_types: HashMap<String, ColumnType>,

    /// Field value that means NULL, e.g. `\N`.
    pub null_marker: Option<String>,

    /// Flush the sink every this many emitted rows.
    pub flush_every: Option<usize>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            columns: None,
            column_types: HashMap::new(),
            null_marker: None,
            flush_every: None,
        }
    }
}

/// Counters for one CSV load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvLoadStats {
    /// Data records read, excluding the header.
    pub rows_read: u64,
    pub rows_emitted: u64,
    pub bad_rows: u64,
    pub cancelled: bool,
}

/// Records buffered between the reading thread and the emitting task.
const READ_AHEAD: usize = 1024;

/// What the blocking reader hands to the async side.
enum ReadEvent {
    Header(Vec<String>),
    Record(csv::StringRecord),
    /// A record that could not be decoded; counted and skipped.
    Unreadable(String),
}

/// Stream every record of `reader` into `sink` as rows of `table`.
///
/// Parsing runs on a blocking thread and feeds records through a bounded
/// channel, so a slow file never stalls the runtime and a slow sink holds
/// the reader back. The sink is not flushed at the end; the caller drains it.
pub async fn load_csv<R: Read + Send + 'static>(
    reader: R,
    table: &str,
    options: &CsvOptions,
    sink: &mut dyn RowSink,
    cancel: &CancellationToken,
) -> Result<CsvLoadStats> {
    if !options.has_header && options.columns.is_none() {
        return Err(MigrateError::Config(
            "CSV without a header needs explicit column names".into(),
        ));
    }

    let csv_reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(options.has_header)
        .flexible(true)
        .from_reader(reader);

    let (tx, mut rx) = mpsc::channel::<Result<ReadEvent>>(READ_AHEAD);
    let has_header = options.has_header;
    let reader_cancel = cancel.clone();
    let reading =
        tokio::task::spawn_blocking(move || read_records(csv_reader, has_header, tx, reader_cancel));

    let header = if has_header {
        match rx.recv().await {
            Some(Ok(ReadEvent::Header(header))) => header,
            Some(Err(e)) => return Err(e),
            _ => Vec::new(),
        }
    } else {
        Vec::new()
    };
    let columns: Vec<String> = options.columns.clone().unwrap_or(header);
    if columns.is_empty() {
        return Err(MigrateError::Source(format!("No columns found for table {}", table)));
    }

    let types: Vec<ColumnType> = columns
        .iter()
        .map(|c| options.column_types.get(c).copied().unwrap_or_default())
        .collect();

    info!("Loading CSV into {} ({} columns)", table, columns.len());

    let mut stats = CsvLoadStats::default();

    loop {
        if cancel.is_cancelled() {
            warn!("CSV load for {} cancelled after {} rows", table, stats.rows_read);
            stats.cancelled = true;
            break;
        }

        let record = match rx.recv().await {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(ReadEvent::Record(record))) => record,
            Some(Ok(ReadEvent::Unreadable(reason))) => {
                stats.rows_read += 1;
                stats.bad_rows += 1;
                warn!("Skipping record with invalid UTF-8: {}", reason);
                continue;
            }
            Some(Ok(ReadEvent::Header(_))) => continue,
        };
        stats.rows_read += 1;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() != columns.len() {
            stats.bad_rows += 1;
            warn!(
                "Skipping line {}: expected {} fields, found {}",
                line,
                columns.len(),
                record.len()
            );
            continue;
        }

        match convert_record(&record, &types, options.null_marker.as_deref()) {
            Ok(values) => {
                sink.emit(table, &columns, values).await?;
                stats.rows_emitted += 1;
            }
            Err(reason) => {
                stats.bad_rows += 1;
                warn!("Skipping line {}: {}", line, reason);
                continue;
            }
        }

        if let Some(every) = options.flush_every {
            if every > 0 && stats.rows_emitted % every as u64 == 0 {
                sink.flush().await?;
                debug!("Flushed {} rows of {}", stats.rows_emitted, table);
            }
        }
    }

    // Closing the channel unblocks a reader still waiting for room
    drop(rx);
    reading
        .await
        .map_err(|e| MigrateError::Source(format!("CSV reader for {} failed: {}", table, e)))?;

    info!(
        "CSV load for {}: {} read, {} emitted, {} bad",
        table, stats.rows_read, stats.rows_emitted, stats.bad_rows
    );
    Ok(stats)
}

/// Blocking half of [`load_csv`]: parse records until the input ends, a fatal
/// error is sent, the receiver goes away, or the load is cancelled.
fn read_records<R: Read>(
    mut csv_reader: csv::Reader<R>,
    has_header: bool,
    tx: mpsc::Sender<Result<ReadEvent>>,
    cancel: CancellationToken,
) {
    if has_header {
        let header = csv_reader
            .headers()
            .map(|h| h.iter().map(|name| name.trim().to_string()).collect())
            .map_err(MigrateError::from);
        let fatal = header.is_err();
        if tx.blocking_send(header.map(ReadEvent::Header)).is_err() || fatal {
            return;
        }
    }

    while !cancel.is_cancelled() {
        let mut record = csv::StringRecord::new();
        let event = match csv_reader.read_record(&mut record) {
            Ok(true) => Ok(ReadEvent::Record(record)),
            Ok(false) => return,
            Err(e) if matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) => {
                Ok(ReadEvent::Unreadable(e.to_string()))
            }
            Err(e) => Err(e.into()),
        };
        let fatal = event.is_err();
        if tx.blocking_send(event).is_err() || fatal {
            return;
        }
    }
}

fn convert_record(
    record: &csv::StringRecord,
    types: &[ColumnType],
    null_marker: Option<&str>,
) -> std::result::Result<Vec<SqlValue>, String> {
    record
        .iter()
        .zip(types)
        .map(|(field, ty)| match null_marker {
            Some(marker) if field == marker => Ok(SqlValue::Null(ty.null_type())),
            _ => ty.parse_value(field),
        })
        .collect()
}
