//! Layered pre-execution admission control and output hygiene.
//!
//! A submitted plan passes through the scanner pipeline, then the LLM
//! intent verifier, then the permission guard, before the first action is
//! scheduled. A REJECT anywhere produces a [`RejectionDetails`] record that
//! is persisted with the plan and surfaced to the submitting model; the
//! plan never reaches RUNNING.

pub mod guard;
pub mod llm;
pub mod profiles;
pub mod rate_limiter;
pub mod sanitizer;
pub mod scanners;
pub mod verifier;

use serde::{Deserialize, Serialize};

use crate::security::scanners::ScanResult;

/// Which admission gate refused the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionSource {
    ScannerPipeline,
    IntentVerifier,
    PermissionGuard,
    RateLimiter,
}

impl std::fmt::Display for RejectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectionSource::ScannerPipeline => "scanner_pipeline",
            RejectionSource::IntentVerifier => "intent_verifier",
            RejectionSource::PermissionGuard => "permission_guard",
            RejectionSource::RateLimiter => "rate_limiter",
        };
        f.write_str(s)
    }
}

/// Structured diagnosis returned when a plan is refused before execution.
/// Round-trips verbatim through the state store's `data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionDetails {
    pub source: RejectionSource,
    pub verdict: String,
    pub risk_score: f64,
    #[serde(default)]
    pub threat_types: Vec<String>,
    #[serde(default)]
    pub scanner_findings: Vec<ScanResult>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_needed: Option<String>,
}

impl RejectionDetails {
    pub fn new(source: RejectionSource, verdict: &str, risk_score: f64) -> Self {
        Self {
            source,
            verdict: verdict.to_string(),
            risk_score,
            threat_types: Vec::new(),
            scanner_findings: Vec::new(),
            recommendations: Vec::new(),
            clarification_needed: None,
        }
    }
}
