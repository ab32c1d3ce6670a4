// StateStore: the collector's single-writer SQLite-backed persistence
// layer. Same WAL pragmas, same versioned `metadata`-table migration
// scheme, same "one transaction per batch" discipline as this crate's
// other SQLite-backed stores, generalized to the raw/access/dns/error
// event tables this store needs, with upserts translated from the
// Python original's MySQL `ON DUPLICATE KEY UPDATE` to SQLite's
// `INSERT ... ON CONFLICT DO UPDATE`.
//
// The Collector is this store's only writer, so there's no cross-thread
// handoff to a dedicated writer thread: the Collector's loop already
// runs on its own task and calls these methods directly, in order, one
// batch at a time.

use crate::events::{AccessEvent, DnsEvent, ParsedErrorEvent, ParsedEvent, ParsedEventType};
use crate::config::RuntimeValue;
use crate::tailer::TailerState;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestCounts {
    pub raw: u64,
    pub access: u64,
    pub dns: u64,
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating db directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening sqlite db {}", db_path.display()))?;
        let mut store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA foreign_keys=ON;",
        )?;

        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        let version: i64 = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if version < 1 {
            self.apply_schema_v1()?;
        }

        Ok(())
    }

    fn apply_schema_v1(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS raw_events (
                id INTEGER PRIMARY KEY,
                node_id TEXT NOT NULL,
                event_time TEXT NOT NULL,
                event_type TEXT NOT NULL,
                raw_hash TEXT NOT NULL UNIQUE,
                raw_line TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS access_events (
                raw_event_id INTEGER PRIMARY KEY REFERENCES raw_events(id) ON DELETE CASCADE,
                src TEXT NOT NULL,
                status TEXT NOT NULL,
                dest_raw TEXT NOT NULL,
                dest_host TEXT NOT NULL,
                dest_port INTEGER,
                is_domain INTEGER NOT NULL,
                detour TEXT,
                reason TEXT,
                user_email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dns_events (
                raw_event_id INTEGER PRIMARY KEY REFERENCES raw_events(id) ON DELETE CASCADE,
                server TEXT NOT NULL,
                status TEXT NOT NULL,
                domain TEXT NOT NULL,
                ips_json TEXT NOT NULL,
                duration_ms INTEGER,
                error_text TEXT
            );

            CREATE TABLE IF NOT EXISTS error_events (
                id INTEGER PRIMARY KEY,
                node_id TEXT NOT NULL,
                event_time TEXT NOT NULL,
                level TEXT NOT NULL,
                session_id INTEGER,
                component TEXT,
                message TEXT NOT NULL,
                src TEXT,
                dest_host TEXT,
                dest_port INTEGER,
                category TEXT NOT NULL,
                is_noise INTEGER NOT NULL,
                signature_hash TEXT NOT NULL,
                raw_hash TEXT NOT NULL UNIQUE,
                raw_line TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS collector_state (
                node_id TEXT NOT NULL,
                component TEXT NOT NULL,
                inode INTEGER,
                offset INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (node_id, component)
            );

            CREATE TABLE IF NOT EXISTS runtime_config (
                node_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (node_id, key)
            );

            CREATE TABLE IF NOT EXISTS runtime_config_history (
                id INTEGER PRIMARY KEY,
                node_id TEXT NOT NULL,
                key TEXT NOT NULL,
                old_value_json TEXT,
                new_value_json TEXT NOT NULL,
                changed_by TEXT NOT NULL,
                source_ip TEXT,
                changed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_raw_events_time ON raw_events(event_time);
            CREATE INDEX IF NOT EXISTS idx_error_events_time ON error_events(event_time);
            ",
        )?;
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- collector_state (tailer offsets) -----------------------------

    pub fn load_state(&self, node_id: &str, component: &str) -> Result<TailerState> {
        let row = self
            .conn
            .query_row(
                "SELECT inode, offset FROM collector_state WHERE node_id = ?1 AND component = ?2",
                params![node_id, component],
                |row| {
                    let inode: Option<i64> = row.get(0)?;
                    let offset: i64 = row.get(1)?;
                    Ok((inode, offset))
                },
            )
            .optional()?;

        Ok(match row {
            Some((inode, offset)) => TailerState {
                inode: inode.map(|v| v as u64),
                offset: offset as u64,
            },
            None => TailerState::default(),
        })
    }

    pub fn save_state(&self, node_id: &str, component: &str, state: TailerState) -> Result<()> {
        self.conn.execute(
            "INSERT INTO collector_state (node_id, component, inode, offset, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(node_id, component) DO UPDATE SET
                inode = excluded.inode, offset = excluded.offset, updated_at = excluded.updated_at",
            params![
                node_id,
                component,
                state.inode.map(|v| v as i64),
                state.offset as i64
            ],
        )?;
        Ok(())
    }

    // --- ingestion ------------------------------------------------------

    /// Upserts a batch of access/DNS/unknown events in one transaction.
    /// Idempotent on `raw_hash`: re-ingesting the same line after a crash
    /// updates the existing row instead of duplicating it.
    pub fn ingest_events(&mut self, node_id: &str, events: &[ParsedEvent]) -> Result<IngestCounts> {
        let mut counts = IngestCounts::default();
        let tx = self.conn.transaction()?;
        for ev in events {
            let raw_id: i64 = tx.query_row(
                "INSERT INTO raw_events (node_id, event_time, event_type, raw_hash, raw_line)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(raw_hash) DO UPDATE SET event_time = excluded.event_time
                 RETURNING id",
                params![
                    node_id,
                    ev.event_time.to_rfc3339(),
                    event_type_str(ev.event_type),
                    ev.raw_hash,
                    ev.raw_line,
                ],
                |row| row.get(0),
            )?;
            counts.raw += 1;

            if let Some(access) = &ev.access {
                upsert_access(&tx, raw_id, access)?;
                counts.access += 1;
            }
            if let Some(dns) = &ev.dns {
                upsert_dns(&tx, raw_id, dns)?;
                counts.dns += 1;
            }
        }
        tx.commit()?;
        Ok(counts)
    }

    pub fn ingest_error_events(&mut self, node_id: &str, events: &[ParsedErrorEvent]) -> Result<u64> {
        let tx = self.conn.transaction()?;
        let mut written = 0u64;
        for ev in events {
            tx.execute(
                "INSERT INTO error_events
                    (node_id, event_time, level, session_id, component, message, src,
                     dest_host, dest_port, category, is_noise, signature_hash, raw_hash, raw_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(raw_hash) DO UPDATE SET event_time = excluded.event_time",
                params![
                    node_id,
                    ev.event_time.to_rfc3339(),
                    ev.level,
                    ev.session_id.map(|v| v as i64),
                    ev.component,
                    ev.message,
                    ev.src,
                    ev.dest_host,
                    ev.dest_port.map(|v| v as i64),
                    ev.category.as_str(),
                    ev.is_noise as i64,
                    ev.signature_hash,
                    ev.raw_hash,
                    ev.raw_line,
                ],
            )?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    // --- retention --------------------------------------------------------

    /// Deletes rows older than `retention_days` in LIMIT-bounded chunks,
    /// committing each chunk so a long sweep never holds one giant
    /// transaction open. Returns the total rows deleted across all tables.
    pub fn prune_old_events(&mut self, retention_days: u32, delete_batch_size: u32) -> Result<u64> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();
        let mut total = 0u64;

        total += self.prune_table("raw_events", "event_time", &cutoff, delete_batch_size)?;
        total += self.prune_table("error_events", "event_time", &cutoff, delete_batch_size)?;
        total += self.prune_table(
            "runtime_config_history",
            "changed_at",
            &cutoff,
            delete_batch_size,
        )?;

        Ok(total)
    }

    fn prune_table(
        &mut self,
        table: &str,
        time_col: &str,
        cutoff: &str,
        batch_size: u32,
    ) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let tx = self.conn.transaction()?;
            let deleted = tx.execute(
                &format!(
                    "DELETE FROM {table} WHERE rowid IN (
                        SELECT rowid FROM {table} WHERE {time_col} < ?1 LIMIT ?2
                    )"
                ),
                params![cutoff, batch_size],
            )?;
            tx.commit()?;
            total += deleted as u64;
            if (deleted as u32) < batch_size {
                break;
            }
        }
        Ok(total)
    }

    // --- runtime config ------------------------------------------------

    pub fn load_runtime_overrides(&self, node_id: &str) -> Result<HashMap<String, RuntimeValue>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value_json FROM runtime_config WHERE node_id = ?1")?;
        let rows = stmt.query_map(params![node_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (key, value_json) = row?;
            if let Some(field) = crate::config::runtime::field(&key) {
                if let Some(value) = decode_runtime_value(field.value_type, &value_json) {
                    out.insert(key, value);
                }
            }
        }
        Ok(out)
    }

    /// Persists a validated batch of `(key, value)` runtime config
    /// overrides, appending one `runtime_config_history` row per key. The
    /// caller (RuntimeConfigManager::validate_items) already rejected any
    /// invalid value, so this is pure persistence.
    pub fn update_runtime_config(
        &mut self,
        node_id: &str,
        items: &[(String, RuntimeValue)],
        changed_by: &str,
        source_ip: Option<&str>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (key, value) in items {
            let old: Option<String> = tx
                .query_row(
                    "SELECT value_json FROM runtime_config WHERE node_id = ?1 AND key = ?2",
                    params![node_id, key],
                    |row| row.get(0),
                )
                .optional()?;

            let new_json = encode_runtime_value(value);
            tx.execute(
                "INSERT INTO runtime_config (node_id, key, value_json, updated_at)
                 VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
                 ON CONFLICT(node_id, key) DO UPDATE SET
                    value_json = excluded.value_json, updated_at = excluded.updated_at",
                params![node_id, key, new_json],
            )?;

            tx.execute(
                "INSERT INTO runtime_config_history
                    (node_id, key, old_value_json, new_value_json, changed_by, source_ip, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)",
                params![node_id, key, old, new_json, changed_by, source_ip],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn event_type_str(t: ParsedEventType) -> &'static str {
    match t {
        ParsedEventType::Access => "access",
        ParsedEventType::Dns => "dns",
        ParsedEventType::Unknown => "unknown",
    }
}

fn upsert_access(tx: &rusqlite::Transaction, raw_id: i64, ev: &AccessEvent) -> Result<()> {
    tx.execute(
        "INSERT INTO access_events
            (raw_event_id, src, status, dest_raw, dest_host, dest_port, is_domain, detour, reason, user_email)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(raw_event_id) DO UPDATE SET
            src = excluded.src, status = excluded.status, dest_raw = excluded.dest_raw,
            dest_host = excluded.dest_host, dest_port = excluded.dest_port,
            is_domain = excluded.is_domain, detour = excluded.detour,
            reason = excluded.reason, user_email = excluded.user_email",
        params![
            raw_id,
            ev.src,
            ev.status.as_str(),
            ev.dest_raw,
            ev.dest_host,
            ev.dest_port.map(|v| v as i64),
            ev.is_domain as i64,
            ev.detour,
            ev.reason,
            ev.user_email,
        ],
    )?;
    Ok(())
}

fn upsert_dns(tx: &rusqlite::Transaction, raw_id: i64, ev: &DnsEvent) -> Result<()> {
    let ips_json = serde_json::to_string(&ev.ips)?;
    tx.execute(
        "INSERT INTO dns_events (raw_event_id, server, status, domain, ips_json, duration_ms, error_text)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(raw_event_id) DO UPDATE SET
            server = excluded.server, status = excluded.status, domain = excluded.domain,
            ips_json = excluded.ips_json, duration_ms = excluded.duration_ms, error_text = excluded.error_text",
        params![
            raw_id,
            ev.server,
            ev.status.as_str(),
            ev.domain,
            ips_json,
            ev.duration_ms.map(|v| v as i64),
            ev.error_text,
        ],
    )?;
    Ok(())
}

fn encode_runtime_value(v: &RuntimeValue) -> String {
    match v {
        RuntimeValue::Int(n) => n.to_string(),
        RuntimeValue::Float(n) => n.to_string(),
        RuntimeValue::Bool(b) => b.to_string(),
        RuntimeValue::Csv(items) => serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()),
        RuntimeValue::Enum(s) => serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()),
    }
}

fn decode_runtime_value(ty: crate::config::ValueType, json: &str) -> Option<RuntimeValue> {
    use crate::config::ValueType;
    match ty {
        ValueType::Int => json.parse::<i64>().ok().map(RuntimeValue::Int),
        ValueType::Float => json.parse::<f64>().ok().map(RuntimeValue::Float),
        ValueType::Bool => json.parse::<bool>().ok().map(RuntimeValue::Bool),
        ValueType::Csv => serde_json::from_str::<Vec<String>>(json).ok().map(RuntimeValue::Csv),
        ValueType::Enum => serde_json::from_str::<String>(json).ok().map(RuntimeValue::Enum),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;

    #[test]
    fn ingest_is_idempotent_on_raw_hash() {
        let mut store = StateStore::open_in_memory().unwrap();
        let line = "2024/01/15 10:30:00 from 1.2.3.4 accepted tcp:1.2.3.4:80\n";
        let ev = parse_line(line).unwrap();

        let first = store.ingest_events("node-1", &[ev.clone()]).unwrap();
        let second = store.ingest_events("node-1", &[ev]).unwrap();
        assert_eq!(first.raw, 1);
        assert_eq!(second.raw, 1);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM raw_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn tailer_state_round_trips() {
        let store = StateStore::open_in_memory().unwrap();
        let state = TailerState { inode: Some(42), offset: 1024 };
        store.save_state("node-1", "access", state).unwrap();
        let loaded = store.load_state("node-1", "access").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn prune_deletes_rows_older_than_cutoff() {
        let mut store = StateStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO raw_events (node_id, event_time, event_type, raw_hash, raw_line)
                 VALUES ('node-1', '2000-01-01T00:00:00Z', 'unknown', 'old-hash', 'old')",
                [],
            )
            .unwrap();
        let deleted = store.prune_old_events(30, 100).unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn runtime_config_overrides_round_trip() {
        let mut store = StateStore::open_in_memory().unwrap();
        let items = vec![("batch_size".to_string(), RuntimeValue::Int(500))];
        store
            .update_runtime_config("node-1", &items, "operator", Some("10.0.0.1"))
            .unwrap();

        let overrides = store.load_runtime_overrides("node-1").unwrap();
        assert_eq!(overrides.get("batch_size"), Some(&RuntimeValue::Int(500)));

        let history_count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM runtime_config_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(history_count, 1);
    }
}
