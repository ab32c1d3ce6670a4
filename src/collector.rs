// Collector: the orchestrator state machine. Runs as one dedicated async
// task; all I/O inside a single loop iteration is sequential. Grounded on
// the original's `AuditCollector` (`run_forever`/`_flush`/`start`/`stop`),
// translated from its exception-driven control flow into an explicit
// single-catch-per-iteration discipline, and on the async-task +
// mutex-guarded-stats idiom used elsewhere in this crate (`main.rs`'s
// channel wiring, `events.rs`'s `Stats`).

use crate::cache::CacheProjector;
use crate::config::{RuntimeConfigManager, Settings};
use crate::error_parser::{level_rank, parse_error_line};
use crate::events::{CollectorStats, ParsedErrorEvent, ParsedEvent};
use crate::filter::{should_drop_access, should_drop_error};
use crate::parser::parse_line;
use crate::storage::StateStore;
use crate::tailer::Tailer;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// `collector_state.component` values for the two tailers this crate
/// runs, keyed independently of `file_path` so a config reload that
/// changes `log_path` doesn't orphan the persisted offset.
const ACCESS_COMPONENT: &str = "access";
const ERROR_COMPONENT: &str = "error";

/// Cooperative stop flag shared with whatever spawned the collector task
/// `stop()` sets a flag, the worker observes it at the top of each
/// iteration.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Thread-safe handle to the collector's point-in-time counters; readers
/// (the health heartbeat, an eventual read API) get a cloned snapshot so
/// the mutex is never held across I/O.
#[derive(Clone, Default)]
pub struct SharedStats(Arc<Mutex<CollectorStats>>);

impl SharedStats {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(CollectorStats::new())))
    }

    pub fn snapshot(&self) -> CollectorStats {
        self.0.lock().unwrap().clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut CollectorStats) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }
}

pub struct Collector {
    settings: Settings,
    store: StateStore,
    runtime_config: RuntimeConfigManager,
    cache: CacheProjector,
    access_tailer: Tailer,
    error_tailer: Option<Tailer>,
    stats: SharedStats,
    stop: StopSignal,
}

impl Collector {
    pub async fn new(settings: Settings, store: StateStore) -> Result<Self> {
        let runtime_config = RuntimeConfigManager::new(&settings);
        let cache =
            CacheProjector::connect(&settings.redis_url, &settings.node_id, settings.redis_enabled)
                .await;
        let access_tailer = Tailer::new(&settings.log_path);
        let error_tailer = settings
            .error_log_enabled
            .then(|| Tailer::new(&settings.error_log_path));

        Ok(Self {
            settings,
            store,
            runtime_config,
            cache,
            access_tailer,
            error_tailer,
            stats: SharedStats::new(),
            stop: StopSignal::new(),
        })
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Restores tailer positions from `collector_state` before the first
    /// poll, so a restart resumes exactly where the last committed flush
    /// left off.
    fn load_tailer_state(&mut self) -> Result<()> {
        let node_id = self.settings.node_id.clone();
        let state = self.store.load_state(&node_id, ACCESS_COMPONENT)?;
        self.access_tailer.set_state(state);
        self.stats.with(|s| {
            s.inode = state.inode;
            s.offset = state.offset;
        });

        if let Some(tailer) = self.error_tailer.as_mut() {
            let state = self.store.load_state(&node_id, ERROR_COMPONENT)?;
            tailer.set_state(state);
            self.stats.with(|s| {
                s.error_inode = state.inode;
                s.error_offset = state.offset;
            });
        }
        Ok(())
    }

    /// Runs the loop body until `stop()` is called, then
    /// drains any in-flight batch with one final flush attempt.
    pub async fn run(&mut self) -> Result<()> {
        self.load_tailer_state()?;

        let mut last_flush = Instant::now();
        let mut last_retention = Instant::now() - Duration::from_secs(86_400);
        let mut batch: Vec<ParsedEvent> = Vec::new();
        let mut error_batch: Vec<ParsedErrorEvent> = Vec::new();

        while !self.stop.is_stopped() {
            match self
                .tick(&mut batch, &mut error_batch, &mut last_flush, &mut last_retention)
                .await
            {
                Ok(made_progress) => {
                    if !made_progress {
                        self.publish_health().await;
                        let snapshot = self.runtime_config_snapshot();
                        tokio::time::sleep(Duration::from_secs_f64(
                            snapshot.poll_interval_seconds,
                        ))
                        .await;
                    }
                }
                Err(err) => {
                    self.stats.with(|s| {
                        s.db_write_fail_total += 1;
                        s.last_error = Some(err.to_string());
                    });
                    tracing::error!(%err, "collector iteration failed, retrying after backoff");
                    self.publish_health().await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if !batch.is_empty() || !error_batch.is_empty() {
            self.flush(&mut batch, &mut error_batch).await?;
        }
        Ok(())
    }

    fn runtime_config_snapshot(&self) -> crate::config::RuntimeSnapshot {
        let overrides = self
            .store
            .load_runtime_overrides(&self.settings.node_id)
            .unwrap_or_default();
        self.runtime_config.refresh(&overrides, false)
    }

    /// One loop iteration: read from both tailers, parse, filter, batch,
    /// flush on threshold, run retention on its own cadence. Returns
    /// whether any line was read this iteration (false ⇒ caller should
    /// idle-sleep).
    async fn tick(
        &mut self,
        batch: &mut Vec<ParsedEvent>,
        error_batch: &mut Vec<ParsedErrorEvent>,
        last_flush: &mut Instant,
        last_retention: &mut Instant,
    ) -> Result<bool> {
        let cfg = self.runtime_config_snapshot();

        let access_max = (cfg.batch_size as usize * 4).max(64);
        let lines = self.access_tailer.read_new_lines(access_max)?;
        for line in &lines {
            self.stats.with(|s| s.lines_read_total += 1);
            let Some(parsed) = parse_line(line) else {
                self.stats.with(|s| s.parse_fail_total += 1);
                continue;
            };
            if should_drop_access(parsed.access.as_ref(), &cfg) {
                self.stats.with(|s| s.filtered_total += 1);
                continue;
            }
            self.stats.with(|s| s.last_event_time = Some(parsed.event_time));
            batch.push(parsed);
        }
        if !lines.is_empty() {
            let state = self.access_tailer.state();
            self.stats.with(|s| {
                s.inode = state.inode;
                s.offset = state.offset;
            });
        }

        let mut error_lines: Vec<String> = Vec::new();
        if let Some(tailer) = self.error_tailer.as_mut() {
            let error_max = (cfg.batch_size as usize * 2).max(32);
            error_lines = tailer.read_new_lines(error_max)?;
            for line in &error_lines {
                self.stats.with(|s| s.error_lines_read_total += 1);
                let Some(parsed) = parse_error_line(line) else {
                    self.stats.with(|s| s.error_parse_fail_total += 1);
                    continue;
                };
                if should_drop_error(&parsed, &cfg) {
                    self.stats.with(|s| s.error_filtered_total += 1);
                    continue;
                }
                self.stats
                    .with(|s| s.last_error_event_time = Some(parsed.event_time));
                error_batch.push(parsed);
            }
            if !error_lines.is_empty() {
                let state = tailer.state();
                self.stats.with(|s| {
                    s.error_inode = state.inode;
                    s.error_offset = state.offset;
                });
            }
        }

        let should_flush = (!batch.is_empty() || !error_batch.is_empty())
            && (batch.len() >= cfg.batch_size as usize
                || error_batch.len() >= cfg.batch_size as usize
                || last_flush.elapsed() >= Duration::from_secs_f64(cfg.flush_interval_seconds));
        if should_flush {
            self.flush(batch, error_batch).await?;
            *last_flush = Instant::now();
        }

        if cfg.retention_days > 0
            && last_retention.elapsed()
                >= Duration::from_secs(cfg.retention_cleanup_interval_seconds)
        {
            let deleted = self
                .store
                .prune_old_events(cfg.retention_days, cfg.retention_delete_batch_size)?;
            self.stats.with(|s| {
                s.retention_deleted_total += deleted;
                s.last_retention_time = Some(chrono::Utc::now());
            });
            self.publish_health().await;
            *last_retention = Instant::now();
        }

        Ok(!lines.is_empty() || !error_lines.is_empty())
    }

    /// Flush protocol: ingest, project to cache, persist
    /// offsets, update stats, clear the error, publish health. Offsets are
    /// only saved on the success path of their own ingest, so a failed
    /// ingest leaves the offset stale and the next tick replays the same
    /// bytes - deduped by `raw_hash`.
    async fn flush(
        &mut self,
        batch: &mut Vec<ParsedEvent>,
        error_batch: &mut Vec<ParsedErrorEvent>,
    ) -> Result<()> {
        let started = Instant::now();
        let node_id = self.settings.node_id.clone();

        let mut counts = crate::storage::IngestCounts::default();
        if !batch.is_empty() {
            counts = self.store.ingest_events(&node_id, batch)?;
            self.cache.update_from_events(batch).await;
        }

        let access_state = self.access_tailer.state();
        self.store.save_state(&node_id, ACCESS_COMPONENT, access_state)?;

        let mut error_written = 0u64;
        let mut error_state = crate::tailer::TailerState::default();
        if let Some(tailer) = self.error_tailer.as_ref() {
            if !error_batch.is_empty() {
                error_written = self.store.ingest_error_events(&node_id, error_batch)?;
            }
            error_state = tailer.state();
            self.store.save_state(&node_id, ERROR_COMPONENT, error_state)?;
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.with(|s| {
            s.batches_flushed += 1;
            s.raw_written_total += counts.raw;
            s.access_written_total += counts.access;
            s.dns_written_total += counts.dns;
            s.error_written_total += error_written;
            s.db_last_write_latency_ms = Some(latency_ms);
            s.last_flush_time = Some(chrono::Utc::now());
            s.inode = access_state.inode;
            s.offset = access_state.offset;
            s.error_inode = error_state.inode;
            s.error_offset = error_state.offset;
            s.last_error = None;
        });

        batch.clear();
        error_batch.clear();
        self.publish_health().await;
        Ok(())
    }

    async fn publish_health(&mut self) {
        let snapshot = self.stats.snapshot();
        self.cache.publish_health(&snapshot, &self.settings.node_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::io::Write;

    async fn test_collector(log_path: std::path::PathBuf) -> Collector {
        let settings = Settings {
            log_path,
            error_log_enabled: false,
            redis_enabled: false,
            batch_size: 10,
            flush_interval_seconds: 30.0,
            ..Settings::default()
        };
        let store = StateStore::open_in_memory().unwrap();
        Collector::new(settings, store).await.unwrap()
    }

    #[tokio::test]
    async fn tick_reads_and_batches_access_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(
            &path,
            "2024/01/15 10:30:00 from 1.2.3.4 accepted tcp:example.com:443\n",
        )
        .unwrap();

        let mut collector = test_collector(path).await;
        collector.load_tailer_state().unwrap();

        let mut batch = Vec::new();
        let mut error_batch = Vec::new();
        let mut last_flush = Instant::now();
        let mut last_retention = Instant::now();
        let progressed = collector
            .tick(&mut batch, &mut error_batch, &mut last_flush, &mut last_retention)
            .await
            .unwrap();

        assert!(progressed);
        assert_eq!(batch.len(), 1);
        assert_eq!(collector.stats.snapshot().lines_read_total, 1);
    }

    #[tokio::test]
    async fn flush_persists_offset_and_clears_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "2024/01/15 10:30:00 from 1.2.3.4 accepted tcp:example.com:443").unwrap();

        let mut collector = test_collector(path).await;
        collector.load_tailer_state().unwrap();
        let lines = collector.access_tailer.read_new_lines(10).unwrap();
        let mut batch: Vec<ParsedEvent> = lines.iter().filter_map(|l| parse_line(l)).collect();
        let mut error_batch = Vec::new();

        collector.flush(&mut batch, &mut error_batch).await.unwrap();

        assert!(batch.is_empty());
        let snapshot = collector.stats.snapshot();
        assert_eq!(snapshot.batches_flushed, 1);
        assert_eq!(snapshot.access_written_total, 1);

        let state = collector
            .store
            .load_state(&collector.settings.node_id, ACCESS_COMPONENT)
            .unwrap();
        assert_eq!(state.offset, collector.access_tailer.state().offset);
    }

    #[tokio::test]
    async fn flush_ingests_error_batch_before_persisting_its_offset() {
        let dir = tempfile::tempdir().unwrap();
        let access_path = dir.path().join("access.log");
        let error_path = dir.path().join("error.log");
        std::fs::write(&access_path, "").unwrap();
        let mut f = std::fs::File::create(&error_path).unwrap();
        writeln!(f, "2024/01/15 10:31:00 [Error] something unexpected happened").unwrap();

        let settings = Settings {
            log_path: access_path,
            error_log_path: error_path,
            error_log_enabled: true,
            redis_enabled: false,
            batch_size: 10,
            flush_interval_seconds: 30.0,
            ..Settings::default()
        };
        let store = StateStore::open_in_memory().unwrap();
        let mut collector = Collector::new(settings, store).await.unwrap();
        collector.load_tailer_state().unwrap();

        let error_lines = collector
            .error_tailer
            .as_mut()
            .unwrap()
            .read_new_lines(10)
            .unwrap();
        let mut batch = Vec::new();
        let mut error_batch: Vec<ParsedErrorEvent> = error_lines
            .iter()
            .filter_map(|l| crate::error_parser::parse_error_line(l))
            .collect();
        assert_eq!(error_batch.len(), 1);

        collector.flush(&mut batch, &mut error_batch).await.unwrap();

        assert!(error_batch.is_empty());
        let snapshot = collector.stats.snapshot();
        assert_eq!(
            snapshot.error_written_total, 1,
            "error batch must be ingested by the time its offset is saved"
        );

        let state = collector
            .store
            .load_state(&collector.settings.node_id, ERROR_COMPONENT)
            .unwrap();
        assert_eq!(
            state.offset,
            collector.error_tailer.as_ref().unwrap().state().offset
        );
    }
}
