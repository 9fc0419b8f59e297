//! Row producers feeding the batch writer.

pub mod csv;

pub use self::csv::{load_csv, ColumnType, CsvLoadStats, CsvOptions};
