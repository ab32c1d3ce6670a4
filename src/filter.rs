// Filter: decides whether a parsed event is operationally interesting
// enough to write to the StateStore. Filtering happens after parsing and
// before batching, so dropped lines still advance the tailer's offset and
// are still counted in `CollectorStats`, just not persisted.

use crate::config::RuntimeSnapshot;
use crate::events::{AccessEvent, ErrorCategory, ParsedErrorEvent};
use crate::error_parser::level_rank;

/// Evaluates the access-side drop rules against a RuntimeConfig snapshot.
/// `ev` is `None` for DNS and unknown events, which are never dropped here
/// (filtering only ever applies to the access grammar).
pub fn should_drop_access(ev: Option<&AccessEvent>, cfg: &RuntimeSnapshot) -> bool {
    let Some(ev) = ev else {
        return false;
    };

    if cfg.drop_api_to_api {
        if let Some(detour) = &ev.detour {
            if detour == "api -> api" {
                return true;
            }
        }
    }

    if let Some(detour) = &ev.detour {
        if cfg.exclude_detours.iter().any(|d| d == detour) {
            return true;
        }
    }

    if cfg.drop_invalid_vless_probe
        && ev.status == crate::events::AccessStatus::Rejected
        && ev.dest_raw == "proxy/vless/encoding:"
        && ev
            .reason
            .as_deref()
            .map(|r| r.to_ascii_lowercase().contains("invalid request version"))
            .unwrap_or(false)
    {
        return true;
    }

    if cfg.drop_loopback_traffic {
        let src_is_loopback = ev.src.starts_with("127.0.0.1")
            || ev.src.starts_with("[::1]")
            || ev.src == "::1";
        let dest_is_loopback = matches!(ev.dest_host.as_str(), "127.0.0.1" | "localhost" | "::1" | "[::1]");
        if src_is_loopback || dest_is_loopback {
            return true;
        }
    }

    false
}

/// Evaluates the error-side drop rules: a minimum severity floor plus an
/// optional "drop known noise categories" toggle.
pub fn should_drop_error(ev: &ParsedErrorEvent, cfg: &RuntimeSnapshot) -> bool {
    if level_rank(&ev.level) < level_rank(&cfg.error_min_level) {
        return true;
    }
    if cfg.error_drop_noise && ev.category.is_noise_category() {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AccessStatus;

    fn access(detour: Option<&str>, dest_raw: &str, src: &str, dest_host: &str, reason: Option<&str>) -> AccessEvent {
        AccessEvent {
            src: src.to_string(),
            status: AccessStatus::Rejected,
            dest_raw: dest_raw.to_string(),
            dest_host: dest_host.to_string(),
            dest_port: None,
            is_domain: false,
            detour: detour.map(|s| s.to_string()),
            reason: reason.map(|s| s.to_string()),
            user_email: "unknown".to_string(),
        }
    }

    fn base_cfg() -> RuntimeSnapshot {
        RuntimeSnapshot::defaults()
    }

    #[test]
    fn drops_api_to_api_when_enabled() {
        let mut cfg = base_cfg();
        cfg.drop_api_to_api = true;
        let ev = access(Some("api -> api"), "tcp:x:1", "1.2.3.4", "x", None);
        assert!(should_drop_access(Some(&ev), &cfg));
    }

    #[test]
    fn keeps_api_to_api_when_disabled() {
        let mut cfg = base_cfg();
        cfg.drop_api_to_api = false;
        let ev = access(Some("api -> api"), "tcp:x:1", "1.2.3.4", "x", None);
        assert!(!should_drop_access(Some(&ev), &cfg));
    }

    #[test]
    fn drops_excluded_detour() {
        let mut cfg = base_cfg();
        cfg.exclude_detours = vec!["block".to_string()];
        let ev = access(Some("block"), "tcp:x:1", "1.2.3.4", "x", None);
        assert!(should_drop_access(Some(&ev), &cfg));
    }

    #[test]
    fn drops_invalid_vless_probe() {
        let mut cfg = base_cfg();
        cfg.drop_invalid_vless_probe = true;
        let ev = access(
            None,
            "proxy/vless/encoding:",
            "1.2.3.4",
            "proxy/vless/encoding:",
            Some("invalid request version"),
        );
        assert!(should_drop_access(Some(&ev), &cfg));
    }

    #[test]
    fn drops_loopback_by_src_or_dest() {
        let mut cfg = base_cfg();
        cfg.drop_loopback_traffic = true;
        let by_src = access(None, "tcp:1.1.1.1:80", "127.0.0.1:1234", "1.1.1.1", None);
        assert!(should_drop_access(Some(&by_src), &cfg));

        let by_dest = access(None, "tcp:localhost:80", "10.0.0.1", "localhost", None);
        assert!(should_drop_access(Some(&by_dest), &cfg));
    }

    #[test]
    fn none_event_is_never_dropped() {
        let cfg = base_cfg();
        assert!(!should_drop_access(None, &cfg));
    }
}
