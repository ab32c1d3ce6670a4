// Data model for parsed proxy log lines.
//
// `ParsedEvent` is the unit the Tailer -> AccessParser path produces for
// every access-log line; `ParsedErrorEvent` is the error-log counterpart.
// Both carry a `raw_hash` (sha256 of the normalized raw line) that the
// StateStore uses as an idempotency key, so re-ingesting the same line
// after a crash-and-restart never duplicates a row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One "from SRC accepted|rejected DEST [detour] ..." access-log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub src: String,
    pub status: AccessStatus,
    pub dest_raw: String,
    pub dest_host: String,
    pub dest_port: Option<u16>,
    pub is_domain: bool,
    pub detour: Option<String>,
    pub reason: Option<String>,
    pub user_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatus {
    Accepted,
    Rejected,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Accepted => "accepted",
            AccessStatus::Rejected => "rejected",
        }
    }
}

/// One DNS-resolution log line ("SERVER got answer:|cache HIT:|cache OPTIMISTE: DOMAIN -> [ips]").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsEvent {
    pub server: String,
    pub status: DnsStatus,
    pub domain: String,
    pub ips: Vec<String>,
    pub duration_ms: Option<u64>,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsStatus {
    GotAnswer,
    CacheHit,
    CacheOptimiste,
}

impl DnsStatus {
    /// Reconstructs the exact literal the grammar matched on, used by
    /// storage column values and test assertions.
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsStatus::GotAnswer => "got answer:",
            DnsStatus::CacheHit => "cache HIT:",
            DnsStatus::CacheOptimiste => "cache OPTIMISTE:",
        }
    }
}

/// The result of parsing one access-log line: exactly one of `access` or
/// `dns` is populated, matching whichever grammar matched; neither means
/// the line fell through to `event_type == Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub event_type: ParsedEventType,
    pub event_time: DateTime<Utc>,
    pub raw_hash: String,
    pub raw_line: String,
    pub access: Option<AccessEvent>,
    pub dns: Option<DnsEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsedEventType {
    Access,
    Dns,
    Unknown,
}

/// One parsed error-log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedErrorEvent {
    pub event_time: DateTime<Utc>,
    pub level: String,
    pub session_id: Option<u64>,
    pub component: Option<String>,
    pub message: String,
    pub src: Option<String>,
    pub dest_host: Option<String>,
    pub dest_port: Option<u16>,
    pub category: ErrorCategory,
    pub is_noise: bool,
    pub signature_hash: String,
    pub raw_hash: String,
    pub raw_line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ProbeInvalidVless,
    ApiLoopback,
    DnsError,
    DnsInfo,
    NetworkTimeout,
    NetworkRefused,
    AuthError,
    Routing,
    RuntimeError,
    RuntimeWarning,
    DebugTrace,
    RuntimeInfo,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ProbeInvalidVless => "probe_invalid_vless",
            ErrorCategory::ApiLoopback => "api_loopback",
            ErrorCategory::DnsError => "dns_error",
            ErrorCategory::DnsInfo => "dns_info",
            ErrorCategory::NetworkTimeout => "network_timeout",
            ErrorCategory::NetworkRefused => "network_refused",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::Routing => "routing",
            ErrorCategory::RuntimeError => "runtime_error",
            ErrorCategory::RuntimeWarning => "runtime_warning",
            ErrorCategory::DebugTrace => "debug_trace",
            ErrorCategory::RuntimeInfo => "runtime_info",
        }
    }

    /// `probe_invalid_vless` and `api_loopback` are the noise categories
    /// the collector drops before storage when configured to.
    pub fn is_noise_category(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ProbeInvalidVless | ErrorCategory::ApiLoopback
        )
    }
}

/// Point-in-time counters the Collector exposes via its health heartbeat.
/// A single `std::sync::Mutex<CollectorStats>` owns this; readers get a
/// cloned snapshot so the lock is never held across I/O.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorStats {
    pub started_at: Option<DateTime<Utc>>,
    pub lines_read_total: u64,
    pub parse_fail_total: u64,
    pub filtered_total: u64,
    pub error_lines_read_total: u64,
    pub error_parse_fail_total: u64,
    pub error_filtered_total: u64,
    pub batches_flushed: u64,
    pub raw_written_total: u64,
    pub access_written_total: u64,
    pub dns_written_total: u64,
    pub error_written_total: u64,
    pub retention_deleted_total: u64,
    pub db_write_fail_total: u64,
    pub db_last_write_latency_ms: Option<f64>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_error_event_time: Option<DateTime<Utc>>,
    pub last_flush_time: Option<DateTime<Utc>>,
    pub last_retention_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub inode: Option<u64>,
    pub offset: u64,
    pub error_inode: Option<u64>,
    pub error_offset: u64,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}
