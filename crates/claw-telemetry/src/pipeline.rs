//! Pipeline orchestration.
//!
//! A [`Pipeline`] runs two periodic tokio tasks:
//!
//! - the **collection loop** tails files, queries the journal and container
//!   readers, normalizes and deduplicates, then appends to the buffer;
//! - the **flush loop** drains the buffer and exports it in fixed-size
//!   batches.
//!
//! The buffer is the only state the loops share. Tailer cursors and the
//! dedup table live in a `Collector` that is moved into the collection
//! task and handed back when it stops, so a restarted pipeline resumes
//! where it left off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::EntryBuffer;
use crate::config::PipelineConfig;
use crate::container::ContainerReader;
use crate::dedup::Deduplicator;
use crate::error::{Result, TelemetryError};
use crate::export::{ExportError, Exporter, HttpTransport};
use crate::journal::JournalReader;
use crate::multiline::RawLine;
use crate::normalizer::{Normalizer, Origin, RawRecord};
use crate::source::{LogSource, SourceRegistry};
use crate::spill::SpillStore;
use crate::stats::{Stats, StatsSnapshot};
use crate::tailer::TailerSet;
use crate::traits::{RecordReader, Transport};
use crate::types::{LogEntry, SourceKind};

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Not collecting.
    #[default]
    Stopped,
    /// Both loops are running.
    Running,
    /// Loops are being cancelled and the final flush is in progress.
    Stopping,
}

impl PipelineState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Exhausted batches go back into the buffer.
    Normal,
    /// Exhausted batches go to disk.
    Forced,
}

// ===========================================
// Shared State
// ===========================================

/// State reachable from both loops.
#[derive(Debug)]
struct Shared {
    buffer: Mutex<EntryBuffer>,
    stats: Stats,
    exporter: Exporter,
    spill: SpillStore,
    batch_size: usize,
}

impl Shared {
    fn enqueue(&self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        let evicted = self.buffer.lock().append(entries);
        self.stats.add_dropped(evicted);
    }

    fn requeue(&self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        let evicted = self.buffer.lock().requeue(entries);
        self.stats.add_dropped(evicted);
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    async fn flush(&self, mode: FlushMode) {
        let mut pending = self.buffer.lock().drain_all();
        if pending.is_empty() {
            return;
        }
        debug!(entries = pending.len(), ?mode, "flushing buffer");

        while !pending.is_empty() {
            let rest = pending.split_off(self.batch_size.min(pending.len()));
            let batch = std::mem::replace(&mut pending, rest);
            let n = batch.len();

            match self.exporter.send(&batch).await {
                Ok(()) => {
                    self.stats.add_sent(n);
                    self.stats.mark_send(Utc::now());
                }
                Err(e @ (ExportError::Rejected { .. } | ExportError::Encode(_))) => {
                    error!(entries = n, error = %e, "discarding undeliverable batch");
                    self.stats.add_dropped(n);
                    self.stats.record_error();
                }
                Err(e @ ExportError::Exhausted { .. }) => {
                    self.stats.record_error();
                    match mode {
                        FlushMode::Normal => {
                            warn!(
                                entries = n + pending.len(),
                                error = %e,
                                "export failed, requeueing until next flush"
                            );
                            let mut back = batch;
                            back.append(&mut pending);
                            self.requeue(back);
                        }
                        FlushMode::Forced => {
                            // Once one batch is exhausted the rest go straight to disk.
                            warn!(
                                entries = n + pending.len(),
                                error = %e,
                                "final export failed, spilling remaining entries to disk"
                            );
                            self.spill_batch(&batch);
                            for chunk in pending.chunks(self.batch_size.max(1)) {
                                self.spill_batch(chunk);
                            }
                        }
                    }
                    return;
                }
            }
        }
    }

    fn spill_batch(&self, batch: &[LogEntry]) {
        match self.spill.spill(batch) {
            Ok(path) => {
                info!(path = %path.display(), entries = batch.len(), "batch spilled");
                self.stats.add_buffered_to_disk(batch.len());
                match self.spill.prune() {
                    Ok(pruned) => self.stats.add_dropped(pruned),
                    Err(e) => warn!(error = %e, "failed to prune spill directory"),
                }
            }
            Err(e) => {
                error!(entries = batch.len(), error = %e, "failed to spill batch, entries lost");
                self.stats.add_dropped(batch.len());
                self.stats.record_error();
            }
        }
    }
}

// ===========================================
// Collector
// ===========================================

/// State owned by the collection loop.
///
/// Never shared between tasks: it is moved into the collection task on
/// start and returned by it on stop.
struct Collector {
    registry: SourceRegistry,
    tailers: TailerSet,
    normalizer: Normalizer,
    dedup: Deduplicator,
    journal: Box<dyn RecordReader>,
    containers: Box<dyn RecordReader>,
    /// Time of the last successful read per journal or container source.
    read_marks: HashMap<(SourceKind, String), DateTime<Utc>>,
    interval: Duration,
    max_lookback: Duration,
}

impl Collector {
    /// Lower bound for reading `source` at `now`.
    ///
    /// Only a successful read advances the mark, so a source that failed is
    /// asked again for the whole window it missed.
    fn since(&self, source: &LogSource, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = |d: Duration| {
            chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        };
        let floor = now - window(self.max_lookback);
        self.read_marks
            .get(&(source.kind, source.target.clone()))
            .copied()
            .unwrap_or_else(|| now - window(self.interval))
            .max(floor)
    }

    async fn collect_once(&mut self, shared: &Shared) {
        let now = Utc::now();
        let sources = self.registry.sources().to_vec();
        let mut records = Vec::new();

        for source in &sources {
            match source.kind {
                SourceKind::File => self.tail_files(source, &mut records, &shared.stats),
                SourceKind::Journal | SourceKind::Container => {
                    let since = self.since(source, now);
                    let reader = if source.kind == SourceKind::Journal {
                        &mut self.journal
                    } else {
                        &mut self.containers
                    };
                    match reader.read(source, since).await {
                        Ok(mut batch) => {
                            records.append(&mut batch);
                            self.read_marks.insert((source.kind, source.target.clone()), now);
                        }
                        Err(e) => {
                            debug!(
                                kind = %source.kind,
                                target = %source.target,
                                error = %e,
                                "source skipped this tick"
                            );
                            shared.stats.record_error();
                        }
                    }
                }
            }
        }
        self.tailers.mark_primed();

        let entries: Vec<LogEntry> = records
            .into_iter()
            .flat_map(|record| self.normalizer.normalize(record, now))
            .collect();
        let produced = entries.len();
        let accepted: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| self.dedup.accept(entry))
            .collect();

        if produced > 0 {
            debug!(produced, accepted = accepted.len(), "collection tick");
        }
        shared.stats.add_collected(produced);
        shared.enqueue(accepted);
        shared.stats.mark_collect(now);
    }

    fn tail_files(&mut self, source: &LogSource, records: &mut Vec<RawRecord>, stats: &Stats) {
        for path in SourceRegistry::expand(source) {
            let service = source.service_for(&path);
            match self.tailers.tail(&path, &service) {
                Ok(lines) if lines.is_empty() => {}
                Ok(lines) => records.push(RawRecord::Lines {
                    origin: Origin::new(SourceKind::File, path.display().to_string(), service),
                    lines: lines.into_iter().map(RawLine::new).collect(),
                }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to tail file");
                    stats.record_error();
                }
            }
        }
    }

    async fn run(mut self, shared: Arc<Shared>, cancel: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.collect_once(&shared).await,
            }
        }
        debug!("collection loop stopped");
        self
    }
}

async fn run_flush_loop(shared: Arc<Shared>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => shared.flush(FlushMode::Normal).await,
        }
    }
    debug!("flush loop stopped");
}

// ===========================================
// Pipeline
// ===========================================

struct RunningTasks {
    cancel: CancellationToken,
    collect: JoinHandle<Collector>,
    flush: JoinHandle<()>,
}

/// The log collection and export pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    shared: Arc<Shared>,
    state: Mutex<PipelineState>,
    collector: Mutex<Option<Collector>>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pipeline_id", &self.config.pipeline_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline that posts over HTTP and reads via `journalctl` and `docker`.
    ///
    /// # Errors
    ///
    /// Returns `TelemetryError::Config` if the config is invalid, or
    /// `TelemetryError::Transport` if the HTTP client cannot be built.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        let journal = Box::new(JournalReader::new(config.command_timeout()));
        let containers = Box::new(ContainerReader::new(config.command_timeout()));
        Self::with_parts(config, transport, journal, containers)
    }

    /// Creates a pipeline with injected transport and readers.
    ///
    /// # Errors
    ///
    /// Returns `TelemetryError::Config` if the config is invalid.
    pub fn with_parts(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        journal: Box<dyn RecordReader>,
        containers: Box<dyn RecordReader>,
    ) -> Result<Self> {
        config.validate()?;

        let host = config.resolved_host_id();
        let mut registry = SourceRegistry::new();
        if config.auto_discover {
            for source in SourceRegistry::discover() {
                registry.register(source);
            }
        }
        for source in &config.sources {
            registry.register(source.clone());
        }
        registry.register_custom(config.extra_paths.as_slice());
        info!(
            pipeline_id = %config.pipeline_id,
            host = %host,
            sources = registry.len(),
            "pipeline configured"
        );

        let shared = Arc::new(Shared {
            buffer: Mutex::new(EntryBuffer::new(config.max_buffer_entries)),
            stats: Stats::new(),
            exporter: Exporter::new(&config, host.clone(), transport),
            spill: SpillStore::new(config.resolved_spill_dir(), config.max_spill_files),
            batch_size: config.batch_size,
        });

        let collector = Collector {
            registry,
            tailers: TailerSet::new(),
            normalizer: Normalizer::new(host),
            dedup: Deduplicator::new(config.dedup_window(), config.dedup_horizon()),
            journal,
            containers,
            read_marks: HashMap::new(),
            interval: config.collect_interval(),
            max_lookback: config.journal_max_lookback(),
        };

        Ok(Self {
            config,
            shared,
            state: Mutex::new(PipelineState::Stopped),
            collector: Mutex::new(Some(collector)),
            tasks: Mutex::new(None),
        })
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.shared.buffered(), self.state())
    }

    /// Reloads spilled batches and starts both loops.
    ///
    /// Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns `TelemetryError::InvalidState` while a stop is in progress or
    /// if the collection state was lost by a failed task.
    pub async fn start(&self) -> Result<()> {
        let collector = {
            let mut state = self.state.lock();
            match *state {
                PipelineState::Running => return Ok(()),
                PipelineState::Stopping => {
                    return Err(TelemetryError::InvalidState("pipeline is stopping"));
                }
                PipelineState::Stopped => {}
            }
            let collector = self
                .collector
                .lock()
                .take()
                .ok_or(TelemetryError::InvalidState("collection state was lost"))?;
            *state = PipelineState::Running;
            collector
        };

        let corrupt_before = self.shared.spill.corrupt_files();
        match self.shared.spill.load_all() {
            Ok(reloaded) if !reloaded.is_empty() => {
                info!(entries = reloaded.len(), "requeued spilled entries");
                self.shared.requeue(reloaded);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to reload spilled batches");
                self.shared.stats.record_error();
            }
        }
        for _ in corrupt_before..self.shared.spill.corrupt_files() {
            self.shared.stats.record_error();
        }

        let cancel = CancellationToken::new();
        let collect = tokio::spawn(collector.run(Arc::clone(&self.shared), cancel.clone()));
        let flush = tokio::spawn(run_flush_loop(
            Arc::clone(&self.shared),
            self.config.flush_interval(),
            cancel.clone(),
        ));
        *self.tasks.lock() = Some(RunningTasks {
            cancel,
            collect,
            flush,
        });

        info!(pipeline_id = %self.config.pipeline_id, "pipeline started");
        Ok(())
    }

    /// Stops both loops, runs a final flush and spills whatever still fails.
    ///
    /// Does nothing if not running.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; task failures are logged and counted.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Running {
                return Ok(());
            }
            *state = PipelineState::Stopping;
        }
        info!(pipeline_id = %self.config.pipeline_id, "pipeline stopping");

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            match tasks.collect.await {
                Ok(collector) => *self.collector.lock() = Some(collector),
                Err(e) => {
                    error!(error = %e, "collection task failed");
                    self.shared.stats.record_error();
                }
            }
            if let Err(e) = tasks.flush.await {
                error!(error = %e, "flush task failed");
                self.shared.stats.record_error();
            }
        }

        self.shared.flush(FlushMode::Forced).await;

        *self.state.lock() = PipelineState::Stopped;
        info!(pipeline_id = %self.config.pipeline_id, "pipeline stopped");
        Ok(())
    }

    /// Runs one normal flush immediately.
    pub async fn flush_now(&self) {
        self.shared.flush(FlushMode::Normal).await;
    }
}
