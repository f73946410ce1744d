//! Request metrics and their read models
//!
//! What this module provides
//! - `RequestMetric`: one record per finished turn (success or failure),
//!   with latency, token usage, error kind and the fallback chain
//! - `MetricsRecorder`: a bounded in-memory log of those records
//! - Read models: `recent(owner, limit)` and `summary(owner, window)` with
//!   error rate, average latency, token totals and a per provider/model breakdown
//!
//! Records are also emitted as `tracing` events so a subscriber can ship them
//! elsewhere; the in-memory log only backs the read models.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetric {
    pub request_id: String,
    pub owner: String,
    pub conversation_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub is_stream: bool,
    pub success: bool,
    pub latency_ms: u64,
    pub usage: Usage,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub fallback_from: Option<String>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderModelStats {
    pub provider: String,
    pub model: String,
    pub requests: u64,
    pub success: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub window_secs: u64,
    pub total_requests: u64,
    pub success_requests: u64,
    pub error_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub token_usage: Usage,
    /// Sorted by request count, busiest first.
    pub by_provider_model: Vec<ProviderModelStats>,
}

const MAX_RECENT: usize = 200;
const MAX_MESSAGE_LEN: usize = 2_000;

#[derive(Debug)]
pub struct MetricsRecorder {
    capacity: usize,
    records: Mutex<VecDeque<RequestMetric>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl MetricsRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, mut metric: RequestMetric) {
        if let Some(msg) = metric.error_message.as_mut() {
            if msg.len() > MAX_MESSAGE_LEN {
                let mut cut = MAX_MESSAGE_LEN;
                while !msg.is_char_boundary(cut) {
                    cut -= 1;
                }
                msg.truncate(cut);
            }
        }
        info!(
            request_id = %metric.request_id,
            provider = %metric.provider,
            model = %metric.model,
            success = metric.success,
            latency_ms = metric.latency_ms,
            total_tokens = metric.usage.total_tokens,
            error_kind = metric.error_kind.as_deref().unwrap_or(""),
            "turn finished"
        );
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(metric);
    }

    /// Newest first, at most 200.
    pub fn recent(&self, owner: &str, limit: usize) -> Vec<RequestMetric> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .rev()
            .filter(|r| r.owner == owner)
            .take(limit.clamp(1, MAX_RECENT))
            .cloned()
            .collect()
    }

    pub fn summary(&self, owner: &str, window: Duration) -> MetricsSummary {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let selected: Vec<&RequestMetric> = records
            .iter()
            .filter(|r| r.owner == owner)
            .filter(|r| since.map(|s| r.created_at >= s).unwrap_or(true))
            .collect();

        let total = selected.len() as u64;
        let success = selected.iter().filter(|r| r.success).count() as u64;
        let mut usage = Usage::default();
        let mut latency_sum = 0u64;
        let mut groups: BTreeMap<(String, String), (u64, u64, u64, u64)> = BTreeMap::new();
        for r in &selected {
            usage += r.usage;
            latency_sum += r.latency_ms;
            let g = groups
                .entry((r.provider.clone(), r.model.clone()))
                .or_default();
            g.0 += 1;
            g.1 += u64::from(r.success);
            g.2 += r.latency_ms;
            g.3 += r.usage.total_tokens;
        }
        let mut by_provider_model: Vec<ProviderModelStats> = groups
            .into_iter()
            .map(|((provider, model), (requests, ok, latency, tokens))| ProviderModelStats {
                provider,
                model,
                requests,
                success: ok,
                errors: requests - ok,
                error_rate: ratio(requests - ok, requests),
                avg_latency_ms: average(latency, requests),
                tokens,
            })
            .collect();
        by_provider_model.sort_by(|a, b| b.requests.cmp(&a.requests));

        MetricsSummary {
            window_secs: window.as_secs(),
            total_requests: total,
            success_requests: success,
            error_requests: total - success,
            error_rate: ratio(total - success, total),
            avg_latency_ms: average(latency_sum, total),
            token_usage: usage,
            by_provider_model,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10_000.0).round() / 10_000.0
}

fn average(sum: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (sum as f64 / count as f64 * 100.0).round() / 100.0
}
