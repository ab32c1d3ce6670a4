// CacheProjector: best-effort realtime aggregates published to Redis for
// an external read-side query surface. Grounded on the original's
// `redis_cache.py` for key naming and pipeline shape, with the async
// client idiom (`ConnectionManager`, `Result` wrapping) borrowed from a
// sibling Redis-backed cache in this corpus.
//
// Every public method swallows its own Redis errors and logs at `warn`:
// the cache is never allowed to fail a flush.

use crate::events::{AccessEvent, CollectorStats, ParsedEvent};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;

pub struct CacheProjector {
    node_id: String,
    conn: Option<ConnectionManager>,
}

/// The JSON shape pushed onto `audit:recent_events:{node}`, mirroring the
/// original's `compact` dict.
#[derive(Debug, Serialize)]
struct RecentEvent<'a> {
    event_time: DateTime<Utc>,
    event_type: &'a str,
    raw: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest_host: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest_raw: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_server: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_status: Option<&'static str>,
}

impl CacheProjector {
    /// Connects eagerly; a connection failure is logged and the projector
    /// degrades to a no-op rather than blocking startup, since the cache
    /// layer is never load-bearing for ingestion correctness.
    pub async fn connect(redis_url: &str, node_id: &str, enabled: bool) -> Self {
        if !enabled {
            return Self {
                node_id: node_id.to_string(),
                conn: None,
            };
        }

        match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    tracing::info!(%redis_url, "cache projector connected");
                    Self {
                        node_id: node_id.to_string(),
                        conn: Some(conn),
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "cache projector failed to connect, running disabled");
                    Self {
                        node_id: node_id.to_string(),
                        conn: None,
                    }
                }
            },
            Err(err) => {
                tracing::warn!(%err, "invalid redis url, cache projector disabled");
                Self {
                    node_id: node_id.to_string(),
                    conn: None,
                }
            }
        }
    }

    fn minute_bucket_key(&self, t: DateTime<Utc>) -> String {
        format!(
            "audit:domains:{}:{}",
            self.node_id,
            t.format("%Y%m%d%H%M")
        )
    }

    fn active_users_key(&self) -> String {
        format!("audit:active_users:{}", self.node_id)
    }

    fn recent_events_key(&self) -> String {
        format!("audit:recent_events:{}", self.node_id)
    }

    fn health_key(&self) -> String {
        format!("audit:health:{}", self.node_id)
    }

    /// Pipelines domain-bucket increments, active-user recency updates and
    /// the recent-events ring for one flushed batch. No-op if disabled or
    /// the batch is empty.
    pub async fn update_from_events(&mut self, events: &[ParsedEvent]) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if events.is_empty() {
            return;
        }

        let mut pipe = redis::pipe();
        let now_ts = Utc::now().timestamp();
        let active_key = self.active_users_key();
        let recent_key = self.recent_events_key();

        for ev in events {
            let compact = build_recent_event(ev);
            let json = serde_json::to_string(&compact).unwrap_or_default();

            if let Some(access) = &ev.access {
                if !access.dest_host.is_empty() {
                    let bucket = self.minute_bucket_key(ev.event_time);
                    pipe.cmd("ZINCRBY").arg(&bucket).arg(1).arg(&access.dest_host);
                    pipe.cmd("EXPIRE").arg(&bucket).arg(900);
                }
                if access.user_email != "unknown" && !access.user_email.is_empty() {
                    pipe.cmd("ZADD")
                        .arg(&active_key)
                        .arg(ev.event_time.timestamp())
                        .arg(&access.user_email);
                }
            }

            pipe.cmd("LPUSH").arg(&recent_key).arg(json);
        }

        pipe.cmd("LTRIM").arg(&recent_key).arg(0).arg(999);
        pipe.cmd("EXPIRE").arg(&recent_key).arg(900);
        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(&active_key)
            .arg(0)
            .arg(now_ts - 3600);
        pipe.cmd("EXPIRE").arg(&active_key).arg(7200);

        if let Err(err) = pipe.query_async::<()>(conn).await {
            tracing::warn!(%err, "cache projector update_from_events failed, dropping");
        }
    }

    /// Returns the `minutes` most recent domain buckets unioned together,
    /// top `limit` by hit count. Used by the (out-of-scope) read API;
    /// exposed here since the union/expire dance is cache-side logic.
    pub async fn top_domains(&mut self, minutes: u32, limit: usize) -> Vec<(String, i64)> {
        let Some(conn) = self.conn.as_mut() else {
            return Vec::new();
        };

        let now = Utc::now();
        let mut keys = Vec::with_capacity(minutes as usize);
        for i in 0..minutes {
            let t = now - chrono::Duration::minutes(i as i64);
            keys.push(self.minute_bucket_key(t));
        }

        let existing: Vec<String> = {
            let mut out = Vec::new();
            for key in &keys {
                let exists: bool = conn.exists(key).await.unwrap_or(false);
                if exists {
                    out.push(key.clone());
                }
            }
            out
        };
        if existing.is_empty() {
            return Vec::new();
        }

        let temp_key = format!("audit:tmp:domains:{}:{}", self.node_id, now.timestamp());
        let mut pipe = redis::pipe();
        pipe.cmd("ZUNIONSTORE")
            .arg(&temp_key)
            .arg(existing.len())
            .arg(&existing);
        pipe.cmd("EXPIRE").arg(&temp_key).arg(10);
        pipe.cmd("ZREVRANGE")
            .arg(&temp_key)
            .arg(0)
            .arg(limit.saturating_sub(1).max(0) as i64)
            .arg("WITHSCORES");
        pipe.cmd("DEL").arg(&temp_key);

        let result: Result<(i64, (), Vec<(String, i64)>, i64), _> = pipe.query_async(conn).await;
        match result {
            Ok((_, _, values, _)) => values,
            Err(err) => {
                tracing::warn!(%err, "cache projector top_domains failed");
                Vec::new()
            }
        }
    }

    /// Publishes a health-heartbeat hash, expiring after 300s.
    pub async fn publish_health(&mut self, stats: &CollectorStats, node_id: &str) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        let fields = health_fields(stats, node_id);
        let key = self.health_key();
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(&key).arg(&fields);
        pipe.cmd("EXPIRE").arg(&key).arg(300);

        if let Err(err) = pipe.query_async::<()>(conn).await {
            tracing::warn!(%err, "cache projector publish_health failed");
        }
    }
}

fn build_recent_event(ev: &ParsedEvent) -> RecentEvent<'_> {
    let event_type = match ev.event_type {
        crate::events::ParsedEventType::Access => "access",
        crate::events::ParsedEventType::Dns => "dns",
        crate::events::ParsedEventType::Unknown => "unknown",
    };

    let mut out = RecentEvent {
        event_time: ev.event_time,
        event_type,
        raw: &ev.raw_line,
        email: None,
        dest_host: None,
        dest_raw: None,
        status: None,
        confidence: None,
        dns_server: None,
        domain: None,
        dns_status: None,
    };

    if let Some(a) = &ev.access {
        out.email = Some(a.user_email.as_str());
        out.dest_host = Some(a.dest_host.as_str());
        out.dest_raw = Some(a.dest_raw.as_str());
        out.status = Some(a.status.as_str());
        out.confidence = Some(confidence_of(a));
    }
    if let Some(d) = &ev.dns {
        out.dns_server = Some(d.server.as_str());
        out.domain = Some(d.domain.as_str());
        out.dns_status = Some(d.status.as_str());
    }

    out
}

fn confidence_of(a: &AccessEvent) -> &'static str {
    if a.is_domain {
        "high"
    } else {
        "low"
    }
}

/// Flattens the stats snapshot into the `(field, value)` pairs an `HSET`
/// mapping expects. Datetimes are RFC3339; `None` becomes `""`.
fn health_fields(stats: &CollectorStats, node_id: &str) -> Vec<(String, String)> {
    fn dt(v: Option<DateTime<Utc>>) -> String {
        v.map(|t| t.to_rfc3339()).unwrap_or_default()
    }
    fn opt<T: ToString>(v: Option<T>) -> String {
        v.map(|x| x.to_string()).unwrap_or_default()
    }

    vec![
        ("node_id".into(), node_id.to_string()),
        ("started_at".into(), dt(stats.started_at)),
        ("lines_read_total".into(), stats.lines_read_total.to_string()),
        ("parse_fail_total".into(), stats.parse_fail_total.to_string()),
        ("filtered_total".into(), stats.filtered_total.to_string()),
        (
            "error_lines_read_total".into(),
            stats.error_lines_read_total.to_string(),
        ),
        (
            "error_parse_fail_total".into(),
            stats.error_parse_fail_total.to_string(),
        ),
        (
            "error_filtered_total".into(),
            stats.error_filtered_total.to_string(),
        ),
        ("batches_flushed".into(), stats.batches_flushed.to_string()),
        ("raw_written_total".into(), stats.raw_written_total.to_string()),
        (
            "access_written_total".into(),
            stats.access_written_total.to_string(),
        ),
        ("dns_written_total".into(), stats.dns_written_total.to_string()),
        (
            "error_written_total".into(),
            stats.error_written_total.to_string(),
        ),
        (
            "retention_deleted_total".into(),
            stats.retention_deleted_total.to_string(),
        ),
        (
            "db_write_fail_total".into(),
            stats.db_write_fail_total.to_string(),
        ),
        (
            "db_last_write_latency_ms".into(),
            opt(stats.db_last_write_latency_ms),
        ),
        ("last_event_time".into(), dt(stats.last_event_time)),
        (
            "last_error_event_time".into(),
            dt(stats.last_error_event_time),
        ),
        ("last_flush_time".into(), dt(stats.last_flush_time)),
        ("last_retention_time".into(), dt(stats.last_retention_time)),
        ("last_error".into(), stats.last_error.clone().unwrap_or_default()),
        ("inode".into(), opt(stats.inode)),
        ("offset".into(), stats.offset.to_string()),
        ("error_inode".into(), opt(stats.error_inode)),
        ("error_offset".into(), stats.error_offset.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectorStats;

    #[test]
    fn health_fields_serialize_none_as_empty_string() {
        let stats = CollectorStats::default();
        let fields = health_fields(&stats, "node-1");
        let last_error = fields.iter().find(|(k, _)| k == "last_error").unwrap();
        assert_eq!(last_error.1, "");
        let inode = fields.iter().find(|(k, _)| k == "inode").unwrap();
        assert_eq!(inode.1, "");
    }

    #[test]
    fn recent_event_carries_access_fields() {
        let line = "2024/01/15 10:30:00 from 1.2.3.4 accepted tcp:example.com:443 email: a@b.com\n";
        let ev = crate::parser::parse_line(line).unwrap();
        let compact = build_recent_event(&ev);
        assert_eq!(compact.email, Some("a@b.com"));
        assert_eq!(compact.dest_host, Some("example.com"));
        assert_eq!(compact.confidence, Some("high"));
    }
}
