//! Telemetry data model - one dual-track record per gateway call
//!
//! Every request produces exactly one [`CallLog`]: the byte-faithful upstream
//! interaction (`RawCall`) alongside the gateway's own derivations
//! (`EstimatedAnalysis`). Raw data is never rewritten once stored; estimates
//! can always be recomputed against it later.

pub mod query;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gateway-measured timing for one call. Integer milliseconds except TPOT,
/// which averages sub-millisecond inter-arrival gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfAnalysis {
    pub ttft_ms: Option<u64>,
    pub tpot_ms: Option<f64>,
    pub total_latency_ms: u64,
    pub tokens_per_second: Option<f64>,
    pub network_latency_ms: Option<u64>,
}

/// Gateway-estimated prompt-cache reuse, with the per-bucket breakdown kept
/// so mispredictions can be attributed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheAnalysis {
    pub estimated_cached_tokens: u64,
    pub estimated_fresh_tokens: u64,
    pub estimated_cache_hit_rate: f64,
    pub system_message_cached: u64,
    pub template_cached: u64,
    pub conversation_history_cached: u64,
}

/// The unmodified wire record for one call.
///
/// `raw_response` holds the upstream-native body: the parsed JSON for
/// buffered calls, or the aggregate reassembled from stream chunks. The
/// `extracted_*` fields are derived but stored alongside so queries never
/// have to re-parse dialect-specific blobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCall {
    // Client request side
    pub request_method: String,
    pub request_url: String,
    pub request_headers: HashMap<String, String>,
    pub request_query: HashMap<String, String>,
    pub raw_request: serde_json::Value,
    pub client_addr: Option<String>,
    pub user_agent: Option<String>,

    // Response side (as returned to the transport, pre-translation)
    pub response_status: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub raw_response: serde_json::Value,
    pub response_size_bytes: Option<u64>,

    // Upstream leg
    pub upstream_url: Option<String>,
    pub upstream_request_headers: HashMap<String, String>,
    pub upstream_status: Option<u16>,
    pub upstream_response_headers: HashMap<String, String>,

    // Extracted (derived but stored alongside raw)
    pub extracted_usage: Option<serde_json::Value>,
    pub extracted_cache_info: Option<serde_json::Value>,
    pub extracted_performance: Option<serde_json::Value>,
}

/// The gateway's own derivations for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatedAnalysis {
    pub perf: PerfAnalysis,
    pub cache: CacheAnalysis,
    pub estimated_cost_usd: f64,
    pub analysis_timestamp: DateTime<Utc>,
}

impl Default for EstimatedAnalysis {
    fn default() -> Self {
        Self {
            perf: PerfAnalysis::default(),
            cache: CacheAnalysis::default(),
            estimated_cost_usd: 0.0,
            analysis_timestamp: Utc::now(),
        }
    }
}

/// One complete call record. Created after the upstream call settles,
/// written exactly once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    /// `messages` or `chat/completions`
    pub endpoint: String,

    pub success: bool,
    pub error_message: Option<String>,

    pub raw: RawCall,
    pub estimated: EstimatedAnalysis,

    pub proxy_used: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,

    // Denormalized leaf columns for query speed
    pub actual_prompt_tokens: Option<u64>,
    pub actual_completion_tokens: Option<u64>,
    pub actual_total_tokens: Option<u64>,
    pub actual_cached_tokens: Option<u64>,
    pub actual_cache_hit_rate: Option<f64>,
}

impl CallLog {
    pub fn new(request_id: String, provider: String, model: String, endpoint: String) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            provider,
            model,
            endpoint,
            success: true,
            error_message: None,
            raw: RawCall::default(),
            estimated: EstimatedAnalysis::default(),
            proxy_used: None,
            user_id: None,
            session_id: None,
            actual_prompt_tokens: None,
            actual_completion_tokens: None,
            actual_total_tokens: None,
            actual_cached_tokens: None,
            actual_cache_hit_rate: None,
        }
    }

    /// Populate the denormalized columns from the extracted blobs.
    /// Called by the store before insert so queries never depend on JSON paths.
    pub fn extract_key_fields(&mut self) {
        if let Some(usage) = &self.raw.extracted_usage {
            self.actual_prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64());
            self.actual_completion_tokens =
                usage.get("completion_tokens").and_then(|v| v.as_u64());
            self.actual_total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64());
        }

        if let Some(cache_info) = &self.raw.extracted_cache_info {
            self.actual_cached_tokens = cache_info.get("cached_tokens").and_then(|v| v.as_u64());
            self.actual_cache_hit_rate =
                cache_info.get("cache_hit_rate").and_then(|v| v.as_f64());
        }
    }
}

/// Generate a unique request ID: millisecond timestamp plus 4 random hex
/// chars. Sorts by creation time and needs no coordination.
pub fn generate_request_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let millis = Utc::now().timestamp_millis();
    // RandomState gives a random value without adding a dependency
    let random = RandomState::new().build_hasher().finish();

    format!("req_{}-{:04x}", millis, random & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..100).map(|_| generate_request_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        assert!(id.starts_with("req_"));
        assert!(id.contains('-'));
    }

    #[test]
    fn test_extract_key_fields_from_usage() {
        let mut log = CallLog::new(
            generate_request_id(),
            "openai".into(),
            "gpt-4".into(),
            "chat/completions".into(),
        );
        log.raw.extracted_usage = Some(json!({
            "prompt_tokens": 12,
            "completion_tokens": 30,
            "total_tokens": 42
        }));
        log.raw.extracted_cache_info = Some(json!({
            "cached_tokens": 6,
            "cache_hit_rate": 0.5
        }));

        log.extract_key_fields();

        assert_eq!(log.actual_prompt_tokens, Some(12));
        assert_eq!(log.actual_completion_tokens, Some(30));
        assert_eq!(log.actual_total_tokens, Some(42));
        assert_eq!(log.actual_cached_tokens, Some(6));
        assert_eq!(log.actual_cache_hit_rate, Some(0.5));
    }

    #[test]
    fn test_extract_key_fields_without_blobs() {
        let mut log = CallLog::new(
            generate_request_id(),
            "anthropic".into(),
            "claude-3-haiku-20240307".into(),
            "messages".into(),
        );
        log.extract_key_fields();
        assert!(log.actual_prompt_tokens.is_none());
        assert!(log.actual_cache_hit_rate.is_none());
    }
}
