//! Telemetry persistence
//!
//! Stores call logs in an embedded DuckDB database using a dedicated writer
//! thread, so the request path never blocks on disk.
//!
//! # Architecture
//!
//! ```text
//! Request pipeline (async)
//!     │
//!     └──→ TelemetryStore.record()          - try_send, drops on overflow
//!             │
//!             └──→ std::sync::mpsc (bounded)
//!                     │
//!                     └──→ Dedicated writer thread
//!                             │
//!                             ├──→ Batch buffer (50 logs or 1s)
//!                             └──→ DuckDB (columnar)
//! ```
//!
//! Overflow policy: a full queue drops the log and bumps a counter. Losing a
//! telemetry row is acceptable; stalling a client response is not.

use super::CallLog;
use anyhow::{Context, Result};
use duckdb::{params, Connection};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Timestamp layout used for TIMESTAMP columns
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Configuration for the telemetry writer
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the DuckDB database file
    pub db_path: PathBuf,
    /// Queue capacity before logs are dropped
    pub channel_buffer: usize,
    /// Batch size before flush
    pub batch_size: usize,
    /// Maximum time before flush (even if the batch is not full)
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./crossgate_logs.db"),
            channel_buffer: 1000,
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Counters for observing the telemetry system itself
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub logs_stored: AtomicU64,
    /// Logs dropped because the queue was full
    pub logs_dropped: AtomicU64,
    /// Logs that failed during the database write
    pub logs_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub logs_stored: u64,
    pub logs_dropped: u64,
    pub logs_failed: u64,
}

enum WriterCommand {
    Store(Box<CallLog>),
    Shutdown,
}

/// Handle for enqueueing call logs; owns the writer thread
pub struct TelemetryStore {
    tx: SyncSender<WriterCommand>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<StoreMetrics>,
}

impl TelemetryStore {
    /// Open the database, apply the schema, and start the writer thread.
    ///
    /// Returns the write handle plus a read-side connection cloned from the
    /// same DuckDB instance (the file stays single-owner).
    pub fn open(config: StoreConfig) -> Result<(Self, Connection)> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.db_path)
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
        init_schema(&conn)?;

        let reader = conn.try_clone().context("Failed to clone read connection")?;

        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(config.channel_buffer);
        let metrics = Arc::new(StoreMetrics::default());
        let writer_metrics = metrics.clone();
        let writer_config = config.clone();

        let writer_handle = thread::Builder::new()
            .name("telemetry-writer".into())
            .spawn(move || {
                if let Err(e) = writer_thread(conn, rx, writer_config, writer_metrics) {
                    tracing::error!("Telemetry writer thread error: {}", e);
                }
            })?;

        tracing::info!(
            "Telemetry store initialized (DuckDB: {})",
            config.db_path.display()
        );

        Ok((
            Self {
                tx,
                writer_handle: Mutex::new(Some(writer_handle)),
                metrics,
            },
            reader,
        ))
    }

    /// Enqueue a log for persistence. Never blocks; a full queue drops the
    /// log and the counter records it.
    pub fn record(&self, log: CallLog) {
        match self.tx.try_send(WriterCommand::Store(Box::new(log))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.logs_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Telemetry queue full, dropping call log");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!("Telemetry writer gone, dropping call log");
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            logs_stored: self.metrics.logs_stored.load(Ordering::Relaxed),
            logs_dropped: self.metrics.logs_dropped.load(Ordering::Relaxed),
            logs_failed: self.metrics.logs_failed.load(Ordering::Relaxed),
        }
    }

    /// Flush pending logs and stop the writer thread. Blocks until done.
    /// Safe to call more than once; later calls are no-ops.
    pub fn shutdown(&self) {
        let handle = self
            .writer_handle
            .lock()
            .expect("writer handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = self.tx.send(WriterCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer thread
// ─────────────────────────────────────────────────────────────────────────────

fn writer_thread(
    mut conn: Connection,
    rx: mpsc::Receiver<WriterCommand>,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
) -> Result<()> {
    let mut batch: Vec<CallLog> = Vec::with_capacity(config.batch_size);
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(config.flush_interval) {
            Ok(WriterCommand::Store(log)) => {
                batch.push(*log);
                if batch.len() >= config.batch_size {
                    flush_batch(&mut conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(WriterCommand::Shutdown) => {
                flush_batch(&mut conn, &mut batch, &metrics);
                tracing::debug!("Telemetry writer thread shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= config.flush_interval {
                    flush_batch(&mut conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_batch(&mut conn, &mut batch, &metrics);
                break;
            }
        }
    }

    Ok(())
}

fn flush_batch(conn: &mut Connection, batch: &mut Vec<CallLog>, metrics: &StoreMetrics) {
    if batch.is_empty() {
        return;
    }

    let result = (|| -> Result<()> {
        let tx = conn.transaction()?;
        for log in batch.iter_mut() {
            log.extract_key_fields();
            insert_log(&tx, log)?;
        }
        tx.commit()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            metrics
                .logs_stored
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            metrics
                .logs_failed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::error!("Failed to flush {} call log(s): {}", batch.len(), e);
        }
    }

    batch.clear();
}

fn insert_log(conn: &Connection, log: &CallLog) -> Result<()> {
    let request_record = serde_json::json!({
        "method": log.raw.request_method,
        "url": log.raw.request_url,
        "headers": log.raw.request_headers,
        "query": log.raw.request_query,
        "body": log.raw.raw_request,
        "client_addr": log.raw.client_addr,
        "user_agent": log.raw.user_agent,
    });
    let response_record = serde_json::json!({
        "status": log.raw.response_status,
        "headers": log.raw.response_headers,
        "body": log.raw.raw_response,
        "size_bytes": log.raw.response_size_bytes,
        "upstream": {
            "url": log.raw.upstream_url,
            "request_headers": log.raw.upstream_request_headers,
            "status": log.raw.upstream_status,
            "response_headers": log.raw.upstream_response_headers,
        },
    });

    conn.execute(
        "INSERT INTO api_calls VALUES (
            ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?,
            ?, ?, ?, ?
        )",
        params![
            log.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            log.request_id,
            log.provider,
            log.model,
            log.endpoint,
            log.success,
            log.error_message,
            request_record.to_string(),
            response_record.to_string(),
            log.raw.extracted_usage.as_ref().map(|v| v.to_string()),
            log.raw.extracted_cache_info.as_ref().map(|v| v.to_string()),
            log.raw.extracted_performance.as_ref().map(|v| v.to_string()),
            log.estimated.perf.ttft_ms.map(|v| v as i64),
            log.estimated.perf.tpot_ms,
            log.estimated.perf.total_latency_ms as i64,
            log.estimated.perf.tokens_per_second,
            log.estimated.cache.estimated_cached_tokens as i64,
            log.estimated.cache.estimated_fresh_tokens as i64,
            log.estimated.cache.estimated_cache_hit_rate,
            log.estimated.estimated_cost_usd,
            log.actual_prompt_tokens.map(|v| v as i64),
            log.actual_completion_tokens.map(|v| v as i64),
            log.actual_total_tokens.map(|v| v as i64),
            log.actual_cached_tokens.map(|v| v as i64),
            log.actual_cache_hit_rate,
            log.proxy_used,
            log.user_id,
            log.session_id,
            log.estimated
                .analysis_timestamp
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        ],
    )
    .with_context(|| format!("Failed to insert call log {}", log.request_id))?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_calls (
            -- Identity
            timestamp TIMESTAMP,
            request_id VARCHAR PRIMARY KEY,
            provider VARCHAR,
            model VARCHAR,
            endpoint VARCHAR,
            success BOOLEAN,
            error_message VARCHAR,

            -- Raw wire record (JSON blobs, never rewritten)
            raw_request JSON,
            raw_response JSON,
            extracted_usage JSON,
            extracted_cache_info JSON,
            extracted_performance JSON,

            -- Gateway estimates (flattened for aggregation)
            estimated_ttft_ms BIGINT,
            estimated_tpot_ms DOUBLE,
            estimated_total_latency_ms BIGINT,
            estimated_tokens_per_second DOUBLE,
            estimated_cached_tokens BIGINT,
            estimated_fresh_tokens BIGINT,
            estimated_cache_hit_rate DOUBLE,
            estimated_cost_usd DOUBLE,

            -- Denormalized truth from upstream (query speed)
            actual_prompt_tokens BIGINT,
            actual_completion_tokens BIGINT,
            actual_total_tokens BIGINT,
            actual_cached_tokens BIGINT,
            actual_cache_hit_rate DOUBLE,

            -- Context
            proxy_used VARCHAR,
            user_id VARCHAR,
            session_id VARCHAR,
            analysis_timestamp TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_model_timestamp ON api_calls(model, timestamp);
        CREATE INDEX IF NOT EXISTS idx_provider_model ON api_calls(provider, model);
        CREATE INDEX IF NOT EXISTS idx_cache_analysis ON api_calls(estimated_cache_hit_rate, actual_cache_hit_rate);
        CREATE INDEX IF NOT EXISTS idx_user_session ON api_calls(user_id, session_id);

        CREATE OR REPLACE VIEW cache_analysis_comparison AS
        SELECT
            request_id,
            provider,
            model,
            estimated_cache_hit_rate,
            actual_cache_hit_rate,
            (actual_cache_hit_rate - estimated_cache_hit_rate) AS hit_rate_diff,
            ABS(actual_cache_hit_rate - estimated_cache_hit_rate) AS prediction_error,
            timestamp
        FROM api_calls
        WHERE actual_cache_hit_rate IS NOT NULL;

        CREATE OR REPLACE VIEW performance_stats AS
        SELECT
            model,
            provider,
            DATE_TRUNC('day', timestamp) AS date,
            COUNT(*) AS request_count,
            AVG(estimated_ttft_ms) AS avg_ttft_ms,
            AVG(estimated_tpot_ms) AS avg_tpot_ms,
            AVG(estimated_total_latency_ms) AS avg_latency_ms,
            AVG(estimated_tokens_per_second) AS avg_tokens_per_second,
            SUM(actual_total_tokens) AS total_tokens,
            SUM(estimated_cost_usd) AS total_cost_usd
        FROM api_calls
        WHERE success = true
        GROUP BY model, provider, DATE_TRUNC('day', timestamp);
        ",
    )
    .context("Failed to initialize telemetry schema")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{generate_request_id, CallLog};
    use serde_json::json;

    fn scratch_config(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfig {
            db_path: dir.path().join("telemetry.db"),
            channel_buffer: 16,
            batch_size: 2,
            flush_interval: Duration::from_millis(50),
        }
    }

    fn sample_log(success: bool) -> CallLog {
        let mut log = CallLog::new(
            generate_request_id(),
            "openai".into(),
            "gpt-3.5-turbo".into(),
            "chat/completions".into(),
        );
        log.success = success;
        if !success {
            log.error_message = Some("upstream returned HTTP 500".into());
        }
        log.raw.raw_request = json!({"model": "gpt-3.5-turbo"});
        log.raw.raw_response = json!({"choices": []});
        log.raw.extracted_usage = Some(json!({
            "prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3
        }));
        log.estimated.perf.total_latency_ms = 120;
        log.estimated.perf.ttft_ms = Some(120);
        log.estimated.estimated_cost_usd = 0.000005;
        log
    }

    #[test]
    fn test_store_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (store, reader) = TelemetryStore::open(scratch_config(&dir)).unwrap();

        store.record(sample_log(true));
        store.record(sample_log(false));
        store.shutdown();

        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM api_calls", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        // Denormalized columns were extracted before insert
        let tokens: i64 = reader
            .query_row(
                "SELECT actual_total_tokens FROM api_calls WHERE success = true",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tokens, 3);

        assert_eq!(store.metrics().logs_stored, 2);
        assert_eq!(store.metrics().logs_dropped, 0);
    }

    #[test]
    fn test_failed_call_keeps_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let (store, reader) = TelemetryStore::open(scratch_config(&dir)).unwrap();

        store.record(sample_log(false));
        store.shutdown();

        let message: String = reader
            .query_row(
                "SELECT error_message FROM api_calls WHERE success = false",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(message.contains("500"));
    }

    #[test]
    fn test_performance_view_excludes_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (store, reader) = TelemetryStore::open(scratch_config(&dir)).unwrap();

        store.record(sample_log(true));
        store.record(sample_log(false));
        store.shutdown();

        let count: i64 = reader
            .query_row("SELECT SUM(request_count) FROM performance_stats", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(&dir);
        {
            let (store, _) = TelemetryStore::open(config.clone()).unwrap();
            store.record(sample_log(true));
            store.shutdown();
        }
        // Reopening against the same file must not lose data
        let (_store, reader) = TelemetryStore::open(config).unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM api_calls", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
