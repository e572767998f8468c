//! Remote ML classifier adapter.
//!
//! Thin wrapper around an external classification service reached over
//! HTTP. The adapter POSTs the plan text plus light context and maps the
//! service's verdict into a [`ScanResult`]. A timeout, connection failure
//! or unparseable body never blocks the pipeline silently: the adapter
//! returns WARN with the error in the finding details (fail-open with
//! visibility).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::security::scanners::{ScanContext, ScanResult, ScanVerdict, Scanner};

#[derive(Debug, Deserialize)]
struct ClassifierReply {
    verdict: String,
    #[serde(default)]
    risk_score: f64,
    #[serde(default)]
    threat_types: Vec<String>,
    #[serde(default)]
    details: String,
}

pub struct MlScannerAdapter {
    scanner_id: String,
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl MlScannerAdapter {
    pub fn new(scanner_id: &str, endpoint: &str, timeout: Duration) -> Self {
        Self {
            scanner_id: scanner_id.to_string(),
            endpoint: endpoint.to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn map_reply(&self, reply: ClassifierReply, elapsed_ms: f64) -> ScanResult {
        let verdict = match reply.verdict.as_str() {
            "reject" | "block" => ScanVerdict::Reject,
            "warn" | "flag" => ScanVerdict::Warn,
            _ => ScanVerdict::Pass,
        };
        ScanResult {
            scanner_id: self.scanner_id.clone(),
            verdict,
            risk_score: reply.risk_score.clamp(0.0, 1.0),
            threat_types: reply.threat_types,
            details: reply.details,
            matched_patterns: Vec::new(),
            scan_duration_ms: elapsed_ms,
        }
    }
}

#[async_trait]
impl Scanner for MlScannerAdapter {
    fn scanner_id(&self) -> &str {
        &self.scanner_id
    }

    async fn scan(&self, text: &str, context: &ScanContext) -> ScanResult {
        let start = Instant::now();
        let body = json!({
            "text": text,
            "context": {
                "plan_id": context.plan_id,
                "description": context.plan_description,
                "action_count": context.action_count,
                "modules": context.module_ids,
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<ClassifierReply>().await
            {
                Ok(reply) => self.map_reply(reply, elapsed_ms),
                Err(e) => {
                    log::warn!(
                        "[Scanner:{}] unparseable classifier reply: {}",
                        self.scanner_id,
                        e
                    );
                    ScanResult::warn_error(&self.scanner_id, &e.to_string())
                }
            },
            Ok(resp) => {
                let status = resp.status();
                log::warn!(
                    "[Scanner:{}] classifier returned HTTP {}",
                    self.scanner_id,
                    status
                );
                ScanResult::warn_error(&self.scanner_id, &format!("HTTP {}", status))
            }
            Err(e) => {
                log::warn!("[Scanner:{}] classifier unreachable: {}", self.scanner_id, e);
                ScanResult::warn_error(&self.scanner_id, &e.to_string())
            }
        }
    }
}
