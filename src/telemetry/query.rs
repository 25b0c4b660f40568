//! Query interface for the telemetry database
//!
//! Read-only access for the HTTP stats endpoint, the terminal viewer, and
//! Parquet export. Uses a connection cloned from the writer's DuckDB
//! instance; reads see a consistent snapshot while the writer thread
//! appends.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::Connection;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Mutex;

/// Filters for the Parquet export
#[derive(Debug, Clone, Default)]
pub struct ExportFilters {
    /// Inclusive lower bound, `YYYY-MM-DD` or full timestamp
    pub start_date: Option<String>,
    /// Inclusive upper bound
    pub end_date: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub success_only: bool,
}

/// Open a telemetry database read-only, leaving a running gateway in sole
/// possession of the write lock.
pub fn open_readonly(db_path: &Path) -> Result<Connection> {
    let config = duckdb::Config::default()
        .access_mode(duckdb::AccessMode::ReadOnly)
        .context("Failed to build database config")?;
    Connection::open_with_flags(db_path, config)
        .with_context(|| format!("Failed to open {} read-only", db_path.display()))
}

/// Read interface over the telemetry schema
pub struct TelemetryQuery {
    conn: Mutex<Connection>,
}

impl TelemetryQuery {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Run an arbitrary parameterized SELECT, rows as JSON objects
    pub fn query(&self, sql: &str, params: &[String]) -> Result<Vec<Value>> {
        let conn = self.conn.lock().expect("query connection lock poisoned");
        let mut stmt = conn.prepare(sql).context("Failed to prepare query")?;

        let mut rows = stmt.query(duckdb::params_from_iter(params.iter()))?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let names = row.as_ref().column_names();
            let mut object = Map::new();
            for (i, name) in names.into_iter().enumerate() {
                object.insert(name.to_string(), value_ref_to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }

        Ok(out)
    }

    /// Aggregate performance over the last `days`, optionally filtered
    pub fn get_performance_stats(
        &self,
        model: Option<&str>,
        provider: Option<&str>,
        days: u32,
    ) -> Result<Value> {
        let mut conditions = vec!["timestamp >= ?".to_string()];
        let mut params = vec![cutoff(days)];

        if let Some(model) = model {
            conditions.push("model = ?".to_string());
            params.push(model.to_string());
        }
        if let Some(provider) = provider {
            conditions.push("provider = ?".to_string());
            params.push(provider.to_string());
        }

        let sql = format!(
            "SELECT
                COUNT(*) AS total_requests,
                COUNT(CASE WHEN success = true THEN 1 END) AS successful_requests,
                AVG(estimated_ttft_ms) AS avg_ttft_ms,
                AVG(estimated_tpot_ms) AS avg_tpot_ms,
                AVG(estimated_total_latency_ms) AS avg_latency_ms,
                AVG(estimated_tokens_per_second) AS avg_tokens_per_second,
                AVG(estimated_cache_hit_rate) AS avg_cache_hit_rate,
                SUM(actual_total_tokens) AS total_tokens,
                SUM(estimated_cost_usd) AS total_cost_usd
            FROM api_calls
            WHERE {}",
            conditions.join(" AND ")
        );

        let rows = self.query(&sql, &params)?;
        Ok(rows.into_iter().next().unwrap_or_else(|| json!({})))
    }

    /// Prediction-accuracy summary over the comparison view
    pub fn get_cache_analysis_summary(&self, days: u32) -> Result<Value> {
        let sql = "SELECT
                COUNT(*) AS total_predictions,
                AVG(prediction_error) AS avg_prediction_error,
                MIN(prediction_error) AS min_prediction_error,
                MAX(prediction_error) AS max_prediction_error,
                COUNT(CASE WHEN prediction_error < 0.1 THEN 1 END) AS accurate_predictions,
                AVG(estimated_cache_hit_rate) AS avg_estimated_hit_rate,
                AVG(actual_cache_hit_rate) AS avg_actual_hit_rate
            FROM cache_analysis_comparison
            WHERE timestamp >= ?";

        let rows = self.query(sql, &[cutoff(days)])?;
        let mut summary = rows.into_iter().next().unwrap_or_else(|| json!({}));

        let total = summary["total_predictions"].as_i64().unwrap_or(0);
        if total > 0 {
            let accurate = summary["accurate_predictions"].as_i64().unwrap_or(0);
            summary["accuracy_percentage"] = json!(accurate as f64 / total as f64 * 100.0);
        }

        Ok(summary)
    }

    /// Overall database statistics
    pub fn get_database_stats(&self, db_path: &Path) -> Result<Value> {
        let total = self.query("SELECT COUNT(*) AS count FROM api_calls", &[])?;
        let total_records = total
            .first()
            .and_then(|r| r["count"].as_i64())
            .unwrap_or(0);

        let provider_breakdown = self.query(
            "SELECT provider, COUNT(*) AS count
             FROM api_calls GROUP BY provider ORDER BY count DESC",
            &[],
        )?;

        let top_models = self.query(
            "SELECT model, COUNT(*) AS count
             FROM api_calls GROUP BY model ORDER BY count DESC LIMIT 10",
            &[],
        )?;

        let db_size_mb = std::fs::metadata(db_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .ok();

        Ok(json!({
            "total_records": total_records,
            "provider_breakdown": provider_breakdown,
            "top_models": top_models,
            "db_size_mb": db_size_mb,
        }))
    }

    /// Most recent calls with the columns the viewers care about
    pub fn get_recent_logs(&self, limit: u32) -> Result<Vec<Value>> {
        self.query(
            &format!(
                "SELECT
                    timestamp, request_id, provider, model, success,
                    estimated_ttft_ms, estimated_tpot_ms, estimated_total_latency_ms,
                    estimated_cache_hit_rate, actual_total_tokens, estimated_cost_usd
                FROM api_calls
                ORDER BY timestamp DESC
                LIMIT {limit}"
            ),
            &[],
        )
    }

    /// Export matching rows to a Parquet file with the same column layout
    pub fn export_parquet(&self, filepath: &Path, filters: &ExportFilters) -> Result<()> {
        let mut conditions: Vec<String> = Vec::new();

        if let Some(start) = &filters.start_date {
            conditions.push(format!("timestamp >= '{}'", escape_literal(start)));
        }
        if let Some(end) = &filters.end_date {
            conditions.push(format!("timestamp <= '{}'", escape_literal(end)));
        }
        if let Some(model) = &filters.model {
            conditions.push(format!("model = '{}'", escape_literal(model)));
        }
        if let Some(provider) = &filters.provider {
            conditions.push(format!("provider = '{}'", escape_literal(provider)));
        }
        if filters.success_only {
            conditions.push("success = true".to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "COPY (SELECT * FROM api_calls{}) TO '{}' (FORMAT PARQUET)",
            where_clause,
            escape_literal(&filepath.to_string_lossy()),
        );

        let conn = self.conn.lock().expect("query connection lock poisoned");
        conn.execute_batch(&sql)
            .with_context(|| format!("Parquet export to {} failed", filepath.display()))?;

        tracing::info!("Exported telemetry to {}", filepath.display());
        Ok(())
    }
}

/// Timestamp literal for "last N days" filters
fn cutoff(days: u32) -> String {
    (Utc::now() - ChronoDuration::days(days as i64))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Single-quote escaping for identifiers that cannot be bound as parameters
/// (COPY targets and their inner SELECT)
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Convert one DuckDB value into JSON for generic query results
fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(v) => json!(v),
        ValueRef::SmallInt(v) => json!(v),
        ValueRef::Int(v) => json!(v),
        ValueRef::BigInt(v) => json!(v),
        ValueRef::HugeInt(v) => json!(v as i64),
        ValueRef::UTinyInt(v) => json!(v),
        ValueRef::USmallInt(v) => json!(v),
        ValueRef::UInt(v) => json!(v),
        ValueRef::UBigInt(v) => json!(v),
        ValueRef::Float(v) => json!(v),
        ValueRef::Double(v) => json!(v),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Null,
        },
        ValueRef::Timestamp(unit, value) => {
            let micros = match unit {
                TimeUnit::Second => value * 1_000_000,
                TimeUnit::Millisecond => value * 1_000,
                TimeUnit::Microsecond => value,
                TimeUnit::Nanosecond => value / 1_000,
            };
            let secs = micros.div_euclid(1_000_000);
            let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
            chrono::DateTime::from_timestamp(secs, nanos)
                .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()))
                .unwrap_or(Value::Null)
        }
        other => {
            tracing::trace!("Unmapped DuckDB value type in query result: {:?}", other);
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::store::{StoreConfig, TelemetryStore};
    use crate::telemetry::{generate_request_id, CallLog};
    use std::time::Duration;

    fn populated_query(dir: &tempfile::TempDir) -> (TelemetryQuery, std::path::PathBuf) {
        let db_path = dir.path().join("telemetry.db");
        let (store, reader) = TelemetryStore::open(StoreConfig {
            db_path: db_path.clone(),
            channel_buffer: 16,
            batch_size: 1,
            flush_interval: Duration::from_millis(20),
        })
        .unwrap();

        for i in 0..3u64 {
            let mut log = CallLog::new(
                generate_request_id(),
                "openai".into(),
                "gpt-3.5-turbo".into(),
                "chat/completions".into(),
            );
            log.estimated.perf.total_latency_ms = 100 + i;
            log.estimated.perf.ttft_ms = Some(100 + i);
            log.estimated.estimated_cost_usd = 0.001;
            log.estimated.cache.estimated_cache_hit_rate = 0.25;
            log.raw.extracted_usage = Some(serde_json::json!({
                "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15
            }));
            log.raw.extracted_cache_info = Some(serde_json::json!({
                "cached_tokens": 5, "cache_hit_rate": 0.5
            }));
            store.record(log);
        }
        store.shutdown();

        (TelemetryQuery::new(reader), db_path)
    }

    #[test]
    fn test_performance_stats_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let (query, _) = populated_query(&dir);

        let stats = query
            .get_performance_stats(Some("gpt-3.5-turbo"), None, 7)
            .unwrap();
        assert_eq!(stats["total_requests"].as_i64(), Some(3));
        assert_eq!(stats["successful_requests"].as_i64(), Some(3));
        assert_eq!(stats["total_tokens"].as_i64(), Some(45));
        assert!(stats["avg_ttft_ms"].as_f64().unwrap() >= 100.0);
    }

    #[test]
    fn test_performance_stats_filter_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let (query, _) = populated_query(&dir);

        let stats = query
            .get_performance_stats(Some("claude-3-opus-20240229"), None, 7)
            .unwrap();
        assert_eq!(stats["total_requests"].as_i64(), Some(0));
    }

    #[test]
    fn test_cache_analysis_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (query, _) = populated_query(&dir);

        let summary = query.get_cache_analysis_summary(7).unwrap();
        assert_eq!(summary["total_predictions"].as_i64(), Some(3));
        // estimated 0.25 vs actual 0.5 -> error 0.25 on every row
        let avg_error = summary["avg_prediction_error"].as_f64().unwrap();
        assert!((avg_error - 0.25).abs() < 1e-9);
        assert!(summary["accuracy_percentage"].as_f64().is_some());
    }

    #[test]
    fn test_database_stats_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let (query, db_path) = populated_query(&dir);

        let stats = query.get_database_stats(&db_path).unwrap();
        assert_eq!(stats["total_records"].as_i64(), Some(3));
        assert_eq!(stats["provider_breakdown"][0]["provider"], "openai");

        let recent = query.get_recent_logs(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0]["request_id"].as_str().unwrap().starts_with("req_"));
    }

    #[test]
    fn test_parquet_export() {
        let dir = tempfile::tempdir().unwrap();
        let (query, _) = populated_query(&dir);

        let out = dir.path().join("export.parquet");
        query
            .export_parquet(
                &out,
                &ExportFilters {
                    success_only: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(out.exists());
        assert!(std::fs::metadata(&out).unwrap().len() > 0);
    }
}
