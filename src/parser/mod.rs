// AccessParser: turns one raw access/DNS log line into a `ParsedEvent`.
//
// Two independent grammars are tried in order (access, then DNS); whichever
// regex matches wins. A line matching neither still produces an event
// (event_type = Unknown) so the Tailer's byte offset always advances -
// malformed input is counted, never silently swallowed.

use crate::events::{AccessEvent, AccessStatus, DnsEvent, DnsStatus, ParsedEvent, ParsedEventType};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn access_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^from\s+(?P<src>\S+)\s+(?P<status>accepted|rejected)\s+(?P<dest>\S+)(?:\s+\[(?P<detour>[^\]]+)\])?(?P<tail>.*)$",
        )
        .unwrap()
    })
}

fn dns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<server>.+?)\s+(?P<status>got answer:|cache HIT:|cache OPTIMISTE:)\s+(?P<domain>\S+)\s+->\s+\[(?P<ips>[^\]]*)\](?P<tail>.*)$",
        )
        .unwrap()
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)email:\s*(\S+)\s*$").unwrap())
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)(ns|us|ms|s|m|h)$").unwrap())
}

fn error_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^>]*)>").unwrap())
}

/// Splits a raw line into `(timestamp, rest)`, trying the two timestamp
/// formats xray itself emits (with and without fractional seconds).
fn parse_timestamp_prefix(raw: &str) -> Option<(DateTime<Utc>, &str)> {
    let mut parts = raw.splitn(3, char::is_whitespace);
    let date = parts.next()?;
    let time = parts.next()?;
    let rest = parts.next().unwrap_or("");
    let stamp = format!("{date} {time}");

    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y/%m/%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&stamp, "%Y/%m/%d %H:%M:%S"))
        .ok()?;
    Some((Utc.from_utc_datetime(&naive), rest))
}

/// Parses a duration literal ("123ms", "1.5s", "900us", "2h") into whole
/// milliseconds, truncating toward zero like the original implementation.
fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim().replace('\u{b5}', "u"); // normalize µs -> us
    let caps = duration_re().captures(&raw)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str();
    let ms = match unit {
        "ns" => value / 1_000_000.0,
        "us" => value / 1_000.0,
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(ms.trunc() as u64)
}

fn is_ip(s: &str) -> bool {
    s.parse::<std::net::IpAddr>().is_ok()
}

/// Splits a `dest` field into `(host, port)`, handling the `tcp:`/`udp:`
/// network prefix, bracketed IPv6 literals, and plain `host:port`.
fn split_host_port(dest: &str) -> (String, Option<u16>) {
    let stripped = dest
        .strip_prefix("tcp:")
        .or_else(|| dest.strip_prefix("udp:"))
        .unwrap_or(dest);

    if let Some(rest) = stripped.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = format!("[{}]", &rest[..end]);
            let after = &rest[end + 1..];
            let port = after.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }

    if is_ip(stripped) {
        return (stripped.to_string(), None);
    }

    let colon_count = stripped.matches(':').count();
    if colon_count == 1 {
        let (host, port) = stripped.split_once(':').unwrap();
        return (host.to_string(), port.parse().ok());
    }

    if colon_count > 1 {
        // Likely a bare IPv6 literal without brackets.
        if is_ip(stripped) {
            return (stripped.to_string(), None);
        }
        if let Some((host, maybe_port)) = stripped.rsplit_once(':') {
            if let Ok(port) = maybe_port.parse::<u16>() {
                return (host.to_string(), Some(port));
            }
        }
        return (stripped.to_string(), None);
    }

    (stripped.to_string(), None)
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(raw_line: &str) -> &str {
    raw_line.trim_end_matches(['\r', '\n'])
}

fn parse_access(rest: &str) -> Option<AccessEvent> {
    let caps = access_re().captures(rest)?;
    let src = caps.name("src")?.as_str().to_string();
    let status = match caps.name("status")?.as_str() {
        "accepted" => AccessStatus::Accepted,
        "rejected" => AccessStatus::Rejected,
        _ => return None,
    };
    let dest_raw = caps.name("dest")?.as_str().to_string();
    let detour = caps.name("detour").map(|m| m.as_str().to_string());
    let tail = caps.name("tail").map(|m| m.as_str()).unwrap_or("");

    let (dest_host, dest_port) = split_host_port(&dest_raw);
    let is_domain = !is_ip(dest_host.trim_start_matches('[').trim_end_matches(']'));

    let (reason, user_email) = match email_re().captures(tail) {
        Some(email_caps) => {
            let email = email_caps.get(1).map(|m| m.as_str()).unwrap_or("unknown");
            let reason = tail[..email_caps.get(0).unwrap().start()].trim();
            (
                if reason.is_empty() {
                    None
                } else {
                    Some(reason.to_string())
                },
                email.to_string(),
            )
        }
        None => {
            let trimmed = tail.trim();
            (
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                },
                "unknown".to_string(),
            )
        }
    };

    Some(AccessEvent {
        src,
        status,
        dest_raw,
        dest_host,
        dest_port,
        is_domain,
        detour,
        reason,
        user_email,
    })
}

fn parse_dns(rest: &str) -> Option<DnsEvent> {
    let caps = dns_re().captures(rest)?;
    let server = caps.name("server")?.as_str().to_string();
    let status = match caps.name("status")?.as_str() {
        "got answer:" => DnsStatus::GotAnswer,
        "cache HIT:" => DnsStatus::CacheHit,
        "cache OPTIMISTE:" => DnsStatus::CacheOptimiste,
        _ => return None,
    };
    let domain = caps.name("domain")?.as_str().to_string();
    let ips_raw = caps.name("ips").map(|m| m.as_str()).unwrap_or("");
    let ips: Vec<String> = ips_raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let mut tail = caps.name("tail").map(|m| m.as_str()).unwrap_or("").to_string();

    let error_text = if let Some(err_caps) = error_text_re().captures(&tail) {
        let text = err_caps.get(1).map(|m| m.as_str().to_string());
        let whole = err_caps.get(0).unwrap();
        tail.replace_range(whole.start()..whole.end(), "");
        text
    } else {
        None
    };

    let duration_ms = parse_duration_ms(tail.trim());

    Some(DnsEvent {
        server,
        status,
        domain,
        ips,
        duration_ms,
        error_text,
    })
}

/// Parses one raw access-log line. Returns `None` only when the line has
/// no recognizable timestamp prefix at all (the line is not log output).
pub fn parse_line(raw_line: &str) -> Option<ParsedEvent> {
    let normalized = normalize(raw_line);
    let (event_time, rest) = parse_timestamp_prefix(normalized)?;
    let raw_hash = sha256_hex(normalized);

    if let Some(access) = parse_access(rest.trim_start()) {
        return Some(ParsedEvent {
            event_type: ParsedEventType::Access,
            event_time,
            raw_hash,
            raw_line: normalized.to_string(),
            access: Some(access),
            dns: None,
        });
    }

    if let Some(dns) = parse_dns(rest.trim_start()) {
        return Some(ParsedEvent {
            event_type: ParsedEventType::Dns,
            event_time,
            raw_hash,
            raw_line: normalized.to_string(),
            access: None,
            dns: Some(dns),
        });
    }

    Some(ParsedEvent {
        event_type: ParsedEventType::Unknown,
        event_time,
        raw_hash,
        raw_line: normalized.to_string(),
        access: None,
        dns: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accepted_access_line_with_email() {
        let line = "2024/01/15 10:30:00.123456 from 192.168.1.5:51234 accepted tcp:updates.example.net:443 [direct] email: alice@example.com\n";
        let ev = parse_line(line).unwrap();
        assert_eq!(ev.event_type, ParsedEventType::Access);
        let access = ev.access.unwrap();
        assert_eq!(access.status, AccessStatus::Accepted);
        assert_eq!(access.dest_host, "updates.example.net");
        assert_eq!(access.dest_port, Some(443));
        assert_eq!(access.detour.as_deref(), Some("direct"));
        assert_eq!(access.user_email, "alice@example.com");
        assert!(access.is_domain);
    }

    #[test]
    fn parses_rejected_access_line_without_email() {
        let line = "2024/01/15 10:30:01 from 10.0.0.2 rejected proxy/vless/encoding: invalid request version\n";
        let ev = parse_line(line).unwrap();
        let access = ev.access.unwrap();
        assert_eq!(access.status, AccessStatus::Rejected);
        assert_eq!(access.user_email, "unknown");
        assert_eq!(access.reason.as_deref(), Some("invalid request version"));
    }

    #[test]
    fn parses_dns_cache_hit_line() {
        let line = "2024/01/15 10:30:02 127.0.0.1:53 cache HIT: example.com -> [93.184.216.34] 1ms\n";
        let ev = parse_line(line).unwrap();
        assert_eq!(ev.event_type, ParsedEventType::Dns);
        let dns = ev.dns.unwrap();
        assert_eq!(dns.status, DnsStatus::CacheHit);
        assert_eq!(dns.status.as_str(), "cache HIT:");
        assert_eq!(dns.ips, vec!["93.184.216.34".to_string()]);
        assert_eq!(dns.duration_ms, Some(1));
    }

    #[test]
    fn parses_dns_error_line_with_rcode() {
        let line = "2024/01/15 10:30:03 127.0.0.1:53 got answer: nonexistent.invalid -> [] <rcode:3> 5ms\n";
        let ev = parse_line(line).unwrap();
        let dns = ev.dns.unwrap();
        assert_eq!(dns.error_text.as_deref(), Some("rcode:3"));
        assert_eq!(dns.duration_ms, Some(5));
    }

    #[test]
    fn unrecognized_grammar_falls_back_to_unknown() {
        let line = "2024/01/15 10:30:04 some unrelated log content here\n";
        let ev = parse_line(line).unwrap();
        assert_eq!(ev.event_type, ParsedEventType::Unknown);
        assert!(ev.access.is_none() && ev.dns.is_none());
    }

    #[test]
    fn missing_timestamp_returns_none() {
        assert!(parse_line("not a log line at all").is_none());
    }

    #[test]
    fn raw_hash_is_stable_across_trailing_newline_variants() {
        let a = parse_line("2024/01/15 10:30:00 from 1.2.3.4 accepted tcp:1.2.3.4:80\n").unwrap();
        let b = parse_line("2024/01/15 10:30:00 from 1.2.3.4 accepted tcp:1.2.3.4:80\r\n").unwrap();
        assert_eq!(a.raw_hash, b.raw_hash);
    }

    #[test]
    fn splits_ipv6_bracketed_host_port() {
        let (host, port) = split_host_port("tcp:[2001:db8::1]:8443");
        assert_eq!(host, "[2001:db8::1]");
        assert_eq!(port, Some(8443));
    }

    #[test]
    fn duration_units_convert_to_milliseconds() {
        assert_eq!(parse_duration_ms("1.5s"), Some(1500));
        assert_eq!(parse_duration_ms("900us"), Some(0));
        assert_eq!(parse_duration_ms("2h"), Some(7_200_000));
    }
}
