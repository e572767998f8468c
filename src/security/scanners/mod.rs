//! Pluggable pre-execution input scanners.
//!
//! A scanner inspects the serialised plan text and returns a verdict. The
//! contract is deliberately small so heuristic rules, remote ML classifiers
//! and anything a deployment wants to add all share one interface:
//! `scan` is async, and it must not fail - a scanner that breaks reports
//! itself as a WARN finding rather than blocking the pipeline.

pub mod adapters;
pub mod heuristic;
pub mod pipeline;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use adapters::MlScannerAdapter;
pub use heuristic::{HeuristicScanner, PatternRule};
pub use pipeline::{PipelineResult, SecurityPipeline};

/// Verdict from a single scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanVerdict {
    Pass,
    Warn,
    Reject,
}

impl ScanVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanVerdict::Pass => "pass",
            ScanVerdict::Warn => "warn",
            ScanVerdict::Reject => "reject",
        }
    }
}

/// Context handed to scanners alongside the raw plan text. Scanners that
/// only need the text ignore it.
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    pub plan_id: String,
    pub plan_description: String,
    pub action_count: usize,
    pub module_ids: Vec<String>,
    pub session_id: Option<String>,
}

/// Result of one scanner run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub scanner_id: String,
    pub verdict: ScanVerdict,
    pub risk_score: f64,
    #[serde(default)]
    pub threat_types: Vec<String>,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub matched_patterns: Vec<String>,
    #[serde(default)]
    pub scan_duration_ms: f64,
}

impl ScanResult {
    pub fn pass(scanner_id: &str) -> Self {
        Self {
            scanner_id: scanner_id.to_string(),
            verdict: ScanVerdict::Pass,
            risk_score: 0.0,
            threat_types: Vec::new(),
            details: String::new(),
            matched_patterns: Vec::new(),
            scan_duration_ms: 0.0,
        }
    }

    /// Used when a scanner itself misbehaves: fail open, but visibly.
    pub fn warn_error(scanner_id: &str, error: &str) -> Self {
        Self {
            scanner_id: scanner_id.to_string(),
            verdict: ScanVerdict::Warn,
            risk_score: 0.0,
            threat_types: Vec::new(),
            details: format!("scanner error: {}", error),
            matched_patterns: Vec::new(),
            scan_duration_ms: 0.0,
        }
    }
}

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Unique id, stable across runs (used in findings and config).
    fn scanner_id(&self) -> &str;

    /// Scan the serialised plan. Must not panic and must not error out -
    /// internal failures are reported as WARN results.
    async fn scan(&self, text: &str, context: &ScanContext) -> ScanResult;
}
