/// Row types for the tables in migrations/0001_init.sql.
/// Read back with `sqlx::query_as`; timestamps are unix milliseconds.
use serde::Serialize;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScanRunRow {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub sourced: i64,
    pub prefiltered_out: i64,
    pub queued: i64,
    pub processed: i64,
    pub matched: i64,
    pub rejected: i64,
    pub errors: i64,
    pub detail_count: i64,
    /// JSON array of strings.
    pub error_list: String,
    pub stop_reason: Option<String>,
    pub failure: Option<String>,
    pub latency_p50_ms: Option<i64>,
    pub latency_p95_ms: Option<i64>,
    pub latency_p99_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScanDetailRow {
    pub seq: i64,
    pub ticker: String,
    pub outcome: String,
    pub reason: String,
    pub elapsed_ms: i64,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ScanHistoryRow {
    pub ticker: String,
    pub last_scanned_at: i64,
    pub scan_count: i64,
    pub last_result: String,
}
