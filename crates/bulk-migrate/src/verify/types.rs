//! Type definitions for expression verification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a generated expression will live on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionKind {
    /// Table CHECK constraint body.
    Check,
    /// Column DEFAULT expression.
    Default,
    /// Generated column, or any other expression evaluated against table rows.
    Generic,
}

impl fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionKind::Check => write!(f, "check"),
            ExpressionKind::Default => write!(f, "default"),
            ExpressionKind::Generic => write!(f, "generic"),
        }
    }
}

/// One candidate expression to validate before cutover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionDetail {
    /// Caller-assigned identifier, echoed back in the report.
    pub id: String,

    pub kind: ExpressionKind,

    pub table: String,

    #[serde(default)]
    pub column: Option<String>,

    /// Expression text in target SQL dialect.
    pub expression: String,

    /// Target column type the expression must produce (defaults only).
    #[serde(default)]
    pub data_type: Option<String>,
}

/// Verification result for one expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionResult {
    pub id: String,
    pub kind: ExpressionKind,
    pub table: String,
    pub column: Option<String>,

    /// `None` when the expression was never probed (fail-fast stop).
    pub passed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration_ms: u64,
}

/// Aggregate outcome of a verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// One entry per input expression, in input order.
    pub results: Vec<ExpressionResult>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,

    /// First failure, set only when the run stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_early: Option<String>,

    pub duration_ms: u64,
}

impl VerificationReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Results that failed, for printing.
    pub fn failures(&self) -> impl Iterator<Item = &ExpressionResult> {
        self.results.iter().filter(|r| r.passed == Some(false))
    }
}
