//! Performance tracking for a single upstream call
//!
//! A tracker is created per request, records monotonic timestamps as chunks
//! arrive, and computes TTFT / TPOT / total latency / throughput once the
//! call settles. Single-use and owned by the request task; no locking.

use crate::telemetry::PerfAnalysis;
use std::time::Instant;

/// Per-request timing state
///
/// `start()` is separate from construction so the tracker can be created
/// while the request is still being parsed without skewing TTFT.
#[derive(Debug)]
pub struct PerformanceTracker {
    request_start: Option<Instant>,
    first_token_time: Option<Instant>,
    token_timestamps: Vec<Instant>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            request_start: None,
            first_token_time: None,
            token_timestamps: Vec::new(),
        }
    }

    /// Mark the start of the upstream request
    pub fn start(&mut self) {
        self.request_start = Some(Instant::now());
    }

    /// Record arrival of one chunk; the first call also pins TTFT
    pub fn record_token(&mut self) {
        let now = Instant::now();
        if self.first_token_time.is_none() {
            self.first_token_time = Some(now);
        }
        self.token_timestamps.push(now);
    }

    /// Number of chunks observed so far
    pub fn observed_chunks(&self) -> u64 {
        self.token_timestamps.len() as u64
    }

    /// Compute metrics for a streaming call with `output_tokens` observed units
    ///
    /// TTFT is first-chunk minus start; TPOT averages inter-arrival time over
    /// the generation window (first chunk to last chunk) and needs at least
    /// two observations to be meaningful.
    pub fn streaming_metrics(&self, output_tokens: u64) -> PerfAnalysis {
        let Some(start) = self.request_start else {
            return PerfAnalysis::default();
        };

        let Some(first) = self.first_token_time else {
            // No chunk ever arrived (empty or failed stream)
            return PerfAnalysis {
                ttft_ms: None,
                tpot_ms: None,
                total_latency_ms: start.elapsed().as_millis() as u64,
                tokens_per_second: None,
                network_latency_ms: None,
            };
        };

        let last = *self.token_timestamps.last().unwrap_or(&first);
        let ttft_ms = first.duration_since(start).as_millis() as u64;
        let total_latency_ms = last.duration_since(start).as_millis() as u64;

        let mut tpot_ms = None;
        let mut tokens_per_second = None;
        if self.token_timestamps.len() > 1 && output_tokens > 1 {
            let generation = last.duration_since(first).as_secs_f64();
            if generation > 0.0 {
                tpot_ms = Some((generation * 1000.0) / output_tokens as f64);
                tokens_per_second = Some(output_tokens as f64 / generation);
            }
        }

        PerfAnalysis {
            ttft_ms: Some(ttft_ms),
            tpot_ms,
            total_latency_ms,
            tokens_per_second,
            network_latency_ms: None,
        }
    }

    /// Compute metrics for a buffered call: the whole body arrives at once,
    /// so TTFT equals total latency and TPOT is unobservable.
    pub fn non_streaming_metrics(&self) -> PerfAnalysis {
        let total_latency_ms = self
            .request_start
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);

        PerfAnalysis {
            ttft_ms: Some(total_latency_ms),
            tpot_ms: None,
            total_latency_ms,
            tokens_per_second: None,
            network_latency_ms: None,
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}
