// ErrorParser: turns one raw xray error-log line into a `ParsedErrorEvent`,
// classifying it into a handful of operational categories so the Collector
// can cheaply drop known noise (invalid-VLESS probes, API loopback) before
// it ever reaches the StateStore.

use crate::events::{ErrorCategory, ParsedErrorEvent};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(?P<date>\d{4}/\d{2}/\d{2})\s+(?P<time>\d{2}:\d{2}:\d{2}(?:\.\d+)?)\s+
            \[(?P<level>\w+)\]\s*
            (?:\[(?P<sid>\d+)\]\s*)?
            (?:(?P<component>[A-Za-z0-9_./-]+):\s+)?
            (?P<message>.*)$
            ",
        )
        .unwrap()
    })
}

fn src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bfrom\s+(?P<src>\S+)").unwrap())
}

fn dest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bfor\s+(?P<dest>(?:tcp|udp):\S+)").unwrap())
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap())
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(raw_line: &str) -> &str {
    raw_line.trim_end_matches(['\r', '\n'])
}

/// Numeric ordering used when comparing against `AUDIT_ERROR_MIN_LEVEL`:
/// higher is more severe. Unrecognized level strings rank 0 (never dropped
/// by a minimum-level filter).
pub fn level_rank(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "debug" => 10,
        "info" => 20,
        "warning" | "warn" => 30,
        "error" => 40,
        _ => 0,
    }
}

fn split_host_port(dest: &str) -> (String, Option<u16>) {
    let stripped = dest
        .strip_prefix("tcp:")
        .or_else(|| dest.strip_prefix("udp:"))
        .unwrap_or(dest);
    match stripped.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()),
        None => (stripped.to_string(), None),
    }
}

/// Classifies a message into one of the fixed operational categories.
/// Order matters: earlier predicates take priority over later, broader
/// ones (e.g. a VLESS probe on the proxy component is reported as the
/// specific probe category, not folded into generic `runtime_error`).
fn classify(component: Option<&str>, message: &str, level: &str) -> ErrorCategory {
    let comp_lower = component.unwrap_or("").to_ascii_lowercase();
    let msg_lower = message.to_ascii_lowercase();
    let haystack = format!("{comp_lower} {msg_lower}");

    if haystack.contains("proxy/vless/encoding") && msg_lower.contains("invalid request version") {
        return ErrorCategory::ProbeInvalidVless;
    }
    if msg_lower.contains("127.0.0.1") && msg_lower.contains("detour [api]") {
        return ErrorCategory::ApiLoopback;
    }
    if haystack.contains("dns") {
        return if msg_lower.contains("timeout")
            || msg_lower.contains("failed")
            || msg_lower.contains("error")
        {
            ErrorCategory::DnsError
        } else {
            ErrorCategory::DnsInfo
        };
    }
    if msg_lower.contains("timeout")
        || msg_lower.contains("deadline exceeded")
        || msg_lower.contains("i/o timeout")
    {
        return ErrorCategory::NetworkTimeout;
    }
    if msg_lower.contains("refused") || msg_lower.contains("connection reset") {
        return ErrorCategory::NetworkRefused;
    }
    if msg_lower.contains("invalid user")
        || msg_lower.contains("failed to find user")
        || msg_lower.contains("unauthorized")
    {
        return ErrorCategory::AuthError;
    }
    if comp_lower.contains("dispatch") || comp_lower.contains("dispatcher") {
        return ErrorCategory::Routing;
    }

    match level.to_ascii_lowercase().as_str() {
        "error" => ErrorCategory::RuntimeError,
        "warning" | "warn" => ErrorCategory::RuntimeWarning,
        "debug" => ErrorCategory::DebugTrace,
        _ => ErrorCategory::RuntimeInfo,
    }
}

/// Masks IPv4 addresses and digit runs before hashing so that two
/// occurrences of "the same" error with different source ports or client
/// IPs collapse to one signature - used for noise-rate reporting, not for
/// idempotent storage (that's `raw_hash`'s job).
fn signature_source(component: Option<&str>, message: &str) -> String {
    let comp = component.unwrap_or("").to_ascii_lowercase();
    let masked_ip = ipv4_re().replace_all(message, "<ip>");
    let masked = digits_re().replace_all(&masked_ip, "<num>");
    format!("{comp}|{}", masked.to_ascii_lowercase())
}

/// Parses one raw error-log line. Returns `None` when the line doesn't
/// match the `[date time] [level] ... message` grammar at all.
pub fn parse_error_line(raw_line: &str) -> Option<ParsedErrorEvent> {
    let normalized = normalize(raw_line);
    let caps = line_re().captures(normalized.trim())?;

    let date = caps.name("date")?.as_str();
    let time = caps.name("time")?.as_str();
    let stamp = format!("{date} {time}");
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y/%m/%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&stamp, "%Y/%m/%d %H:%M:%S"))
        .ok()?;
    let event_time = Utc.from_utc_datetime(&naive);

    let level = caps.name("level")?.as_str().to_string();
    let session_id = caps
        .name("sid")
        .and_then(|m| m.as_str().parse::<u64>().ok());
    let component = caps.name("component").map(|m| m.as_str().to_string());
    let message = caps.name("message")?.as_str().to_string();

    let src = src_re()
        .captures(&message)
        .and_then(|c| c.name("src"))
        .map(|m| m.as_str().to_string());
    let (dest_host, dest_port) = match dest_re().captures(&message).and_then(|c| c.name("dest")) {
        Some(m) => {
            let (h, p) = split_host_port(m.as_str());
            (Some(h), p)
        }
        None => (None, None),
    };

    let category = classify(component.as_deref(), &message, &level);
    let is_noise = category.is_noise_category();
    let signature_hash = sha256_hex(&signature_source(component.as_deref(), &message));
    let raw_hash = sha256_hex(normalized);

    Some(ParsedErrorEvent {
        event_time,
        level,
        session_id,
        component,
        message,
        src,
        dest_host,
        dest_port,
        category,
        is_noise,
        signature_hash,
        raw_hash,
        raw_line: normalized.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_vless_probe() {
        let line = "2024/01/15 10:31:00 [Warning] proxy/vless/encoding: invalid request version\n";
        let ev = parse_error_line(line).unwrap();
        assert_eq!(ev.component.as_deref(), Some("proxy/vless/encoding"));
        assert_eq!(ev.category, ErrorCategory::ProbeInvalidVless);
        assert!(ev.is_noise);
    }

    #[test]
    fn classifies_api_loopback() {
        let line = "2024/01/15 10:31:01 [Info] app/dispatcher: dial tcp 127.0.0.1:443 detour [api]\n";
        let ev = parse_error_line(line).unwrap();
        assert_eq!(ev.category, ErrorCategory::ApiLoopback);
        assert!(ev.is_noise);
    }

    #[test]
    fn classifies_dns_error_vs_dns_info() {
        let err = parse_error_line("2024/01/15 10:31:02 [Warning] app/dns: query failed\n").unwrap();
        assert_eq!(err.category, ErrorCategory::DnsError);

        let info = parse_error_line("2024/01/15 10:31:02 [Info] app/dns: query for telegram.org\n").unwrap();
        assert_eq!(info.category, ErrorCategory::DnsInfo);
    }

    #[test]
    fn classifies_routing_by_dispatcher_component() {
        let line = "2024/01/15 10:31:03 [Warning] app/dispatcher: failed to process outbound\n";
        let ev = parse_error_line(line).unwrap();
        assert_eq!(ev.component.as_deref(), Some("app/dispatcher"));
        assert_eq!(ev.category, ErrorCategory::Routing);
    }

    #[test]
    fn extracts_src_and_dest_from_message() {
        let line = "2024/01/15 10:31:03 [Info] proxy/vless: connection from 10.0.0.5:1234 rejected for tcp:api.telegram.org:443\n";
        let ev = parse_error_line(line).unwrap();
        assert_eq!(ev.component.as_deref(), Some("proxy/vless"));
        assert_eq!(ev.src.as_deref(), Some("10.0.0.5:1234"));
        assert_eq!(ev.dest_host.as_deref(), Some("api.telegram.org"));
        assert_eq!(ev.dest_port, Some(443));
    }

    #[test]
    fn falls_back_to_runtime_category_by_level() {
        let line = "2024/01/15 10:31:04 [Error] something unexpected happened\n";
        let ev = parse_error_line(line).unwrap();
        assert_eq!(ev.category, ErrorCategory::RuntimeError);
        assert!(!ev.is_noise);
    }

    #[test]
    fn level_rank_orders_severity() {
        assert!(level_rank("error") > level_rank("warning"));
        assert!(level_rank("warning") > level_rank("info"));
        assert!(level_rank("info") > level_rank("debug"));
        assert_eq!(level_rank("bogus"), 0);
    }

    #[test]
    fn signature_masks_ips_and_digits() {
        let a = parse_error_line("2024/01/15 10:31:05 [Error] failed from 10.0.0.1:5000\n").unwrap();
        let b = parse_error_line("2024/01/15 10:31:06 [Error] failed from 10.0.0.2:5001\n").unwrap();
        assert_eq!(a.signature_hash, b.signature_hash);
        assert_ne!(a.raw_hash, b.raw_hash);
    }
}
