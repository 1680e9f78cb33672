//! Pipeline driver.
//!
//! One cycle per cadence on a dedicated thread: parse the writer files of
//! the window that just closed, align and emit the window before it, then
//! trim retained history. All mutable state lives in [`Pipeline`] and is
//! only touched from that thread.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::align::{self, Alignment, NoData};
use crate::clock::{self, Window, WindowClock};
use crate::config::Config;
use crate::emit::categorize::{self, Categorizer};
use crate::emit::check::{self, ConsistencyError};
use crate::emit::{correlate, node, workload, EmitCounts};
use crate::export::health::HealthMetrics;
use crate::output::{CommitOutcome, MetricBatch, OutputReader, OutputStore};
use crate::parser::{FileParser, MtimeFilter, ParseStats};
use crate::protocol;
use crate::store::index::RetentionIndex;
use crate::store::request::RequestRecord;
use crate::store::schema::{Family, OS_THREADS, THREAD_NAME, TID};
use crate::store::{Snapshot, SnapshotStore, Stat};
use crate::topology::{TopologyFeed, TopologyHandle};

/// Name of the pipeline thread.
pub const THREAD_NAME_PIPELINE: &str = "reader-pipeline";

/// Settings the driver reads from [`Config`] once at construction.
#[derive(Debug, Clone)]
struct Settings {
    cadence: Duration,
    retained_snapshots: usize,
    rollover_expiry_ms: i64,
    node_families: Vec<Family>,
    consistency_check: bool,
    fail_on_inconsistency: bool,
    janitor_horizon_ms: Option<i64>,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Cadence-aligned cycle time.
    pub curr: i64,
    /// Window emitted this cycle.
    pub window: Window,
    /// File counters summed over every family.
    pub parsed: ParseStats,
    pub counts: EmitCounts,
    pub outcome: CommitOutcome,
    /// Families skipped for the emitted window.
    pub no_data: Vec<(Family, NoData)>,
    pub violation: Option<ConsistencyError>,
}

struct Emission {
    counts: EmitCounts,
    outcome: CommitOutcome,
    no_data: Vec<(Family, NoData)>,
    violation: Option<ConsistencyError>,
}

/// The reader pipeline and all state carried between cycles.
pub struct Pipeline {
    clock: WindowClock,
    settings: Settings,
    parser: FileParser,
    store: SnapshotStore,
    /// OS threads and node families, keyed by newest file mtime.
    sampled: BTreeMap<Family, RetentionIndex<Snapshot>>,
    /// Request families, keyed by reader window start.
    requests: BTreeMap<Family, RetentionIndex<Snapshot>>,
    request_parse_end: Option<i64>,
    last_curr: Option<i64>,
    output: OutputStore,
    categorizer: Categorizer,
    topology: Option<TopologyFeed>,
    metrics: Option<Arc<HealthMetrics>>,
    metrics_root: PathBuf,
}

impl Pipeline {
    /// Build the pipeline from validated configuration. Opens the output
    /// store, re-indexing buckets left by a previous run.
    pub fn new(cfg: &Config, metrics: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let clock = cfg.clock()?;
        let output = OutputStore::open(&cfg.output.dir, cfg.retention.output_buckets)
            .context("opening output store")?;
        let store = SnapshotStore::open().context("opening snapshot store")?;

        let settings = Settings {
            cadence: cfg.cadence,
            retained_snapshots: cfg.retention.snapshots,
            rollover_expiry_ms: duration_ms(cfg.retention.rollover_expiry),
            node_families: cfg.node_families(),
            consistency_check: cfg.diagnostics.thread_consistency_check,
            fail_on_inconsistency: cfg.diagnostics.fail_on_inconsistency,
            janitor_horizon_ms: cfg.janitor.enabled.then(|| duration_ms(cfg.janitor.horizon)),
        };

        let mut sampled = BTreeMap::new();
        sampled.insert(Family::OsThreads, RetentionIndex::new());
        for family in &settings.node_families {
            sampled.insert(*family, RetentionIndex::new());
        }

        let mut requests = BTreeMap::new();
        for family in Family::REQUEST {
            requests.insert(family, RetentionIndex::new());
        }

        let topology = cfg
            .topology
            .path
            .as_deref()
            .map(|path| TopologyFeed::new(path, cfg.topology.refresh_interval));

        if let Some(m) = &metrics {
            if let Some(latest) = output.latest() {
                m.latest_bucket.set(latest as f64);
            }
        }

        Ok(Self {
            clock,
            settings,
            parser: FileParser::new(&cfg.metrics_root),
            store,
            sampled,
            requests,
            request_parse_end: None,
            last_curr: None,
            output,
            categorizer: Categorizer::new()?,
            topology,
            metrics,
            metrics_root: cfg.metrics_root.clone(),
        })
    }

    /// Read handle on the output store for downstream consumers.
    pub fn output_reader(&self) -> OutputReader {
        self.output.reader()
    }

    pub fn topology(&self) -> Option<TopologyHandle> {
        self.topology.as_ref().map(TopologyFeed::handle)
    }

    /// Keys of the raw snapshots retained for `family`.
    pub fn retained_keys(&self, family: Family) -> Vec<i64> {
        self.sampled
            .get(&family)
            .or_else(|| self.requests.get(&family))
            .map(|index| index.keys().collect())
            .unwrap_or_default()
    }

    /// Run one cycle for wall time `now`. Returns `None` when `now` falls
    /// in the same cadence slot as the previous cycle.
    pub fn run_cycle(&mut self, now: i64) -> Result<Option<CycleReport>> {
        let curr = self.clock.floor(now);
        let cadence = self.clock.cadence_ms();

        if let Some(last) = self.last_curr {
            if curr <= last {
                debug!(curr, last, "cadence slot already processed");
                return Ok(None);
            }
            if curr > last + cadence {
                warn!(
                    missed = (curr - last) / cadence - 1,
                    curr = %clock::format_millis(curr),
                    "reader fell behind, skipped windows are not emitted",
                );
            }
        }

        let parsed = self.parse_snapshots(curr)?;

        let window = self.clock.emission_window(curr);
        let emission = self.emit(window)?;

        self.trim_retention(curr)?;
        self.refresh_topology(now);

        self.last_curr = Some(curr);

        if let Some(m) = &self.metrics {
            m.cycles.inc();
        }

        Ok(Some(CycleReport {
            curr,
            window,
            parsed,
            counts: emission.counts,
            outcome: emission.outcome,
            no_data: emission.no_data,
            violation: emission.violation,
        }))
    }

    /// Run cycles until `cancel` fires or a cycle fails. A failure cancels
    /// `cancel` so the rest of the process shuts down with it.
    pub fn run(&mut self, handle: &Handle, cancel: &CancellationToken) -> Result<()> {
        info!(
            cadence = ?self.settings.cadence,
            root = %self.metrics_root.display(),
            "reader pipeline started",
        );

        let mut next_start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let now = clock::now_millis();

            match self.run_cycle(now) {
                Ok(Some(report)) => log_report(&report),
                Ok(None) => {}
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.cycle_failures.inc();
                    }
                    error!(
                        at = %clock::format_millis(now),
                        error = %format!("{e:#}"),
                        "reader cycle failed, stopping pipeline",
                    );
                    cancel.cancel();
                    return Err(e.context("reader cycle failed"));
                }
            }

            if let Some(m) = &self.metrics {
                m.cycle_duration.observe(started.elapsed().as_secs_f64());
            }

            // Fixed-rate: the next cycle starts one cadence after this one was
            // due, or right away when the cycle overran.
            next_start += self.settings.cadence;
            let current = Instant::now();
            if next_start < current {
                next_start = current;
            }
            let wait = next_start - current;

            let stopped = handle.block_on(async {
                tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(wait) => false,
                }
            });
            if stopped {
                break;
            }
        }

        info!("reader pipeline stopped");

        Ok(())
    }

    fn parse_snapshots(&mut self, curr: i64) -> Result<ParseStats> {
        let buckets = self.scan_buckets(curr);
        let cadence = self.clock.cadence_ms();
        let mut total = ParseStats::default();

        let families: Vec<Family> = self.sampled.keys().copied().collect();
        for family in families {
            let stats = self.parse_sampled(family, curr, &buckets)?;
            add_stats(&mut total, stats);
        }

        let after = self.request_parse_end.unwrap_or(curr - cadence);
        for family in Family::REQUEST {
            let stats = self.parse_requests(family, curr, after, &buckets)?;
            add_stats(&mut total, stats);
        }
        self.request_parse_end = Some(curr);

        Ok(total)
    }

    /// Writer buckets that can hold files modified in `(curr - C, curr]`,
    /// always including the bucket before the current one.
    fn scan_buckets(&self, curr: i64) -> Vec<i64> {
        let [prev, current] = self.clock.scan_buckets(curr);
        let rotation = self.clock.rotation_ms();
        let lowest = prev.min(self.clock.bucket_of(curr - self.clock.cadence_ms()));

        let mut buckets = Vec::new();
        let mut bucket = lowest;
        while bucket <= current {
            buckets.push(bucket);
            bucket += rotation;
        }
        buckets
    }

    fn parse_sampled(&mut self, family: Family, curr: i64, buckets: &[i64]) -> Result<ParseStats> {
        let Some(index) = self.sampled.get_mut(&family) else {
            return Ok(ParseStats::default());
        };

        let after = index
            .last_key()
            .unwrap_or(curr - self.clock.cadence_ms());
        let parsed = self
            .parser
            .parse(family, buckets, MtimeFilter::new(after, curr));
        observe_parse(self.metrics.as_deref(), family, parsed.stats);

        let Some(key) = parsed.newest_mtime else {
            return Ok(parsed.stats);
        };

        let snap = self.store.create(family, key)?;
        self.store.bulk_insert(&snap, &parsed.rows)?;
        index.insert(key, snap)?;

        debug!(
            family = %family,
            key = %clock::format_millis(key),
            rows = parsed.rows.len(),
            "snapshot created",
        );

        Ok(parsed.stats)
    }

    fn parse_requests(
        &mut self,
        family: Family,
        curr: i64,
        after: i64,
        buckets: &[i64],
    ) -> Result<ParseStats> {
        let key = curr - self.clock.cadence_ms();
        let parsed = self
            .parser
            .parse(family, buckets, MtimeFilter::new(after, curr));
        observe_parse(self.metrics.as_deref(), family, parsed.stats);

        let index = self.requests.entry(family).or_default();
        let snap = self.store.create(family, key)?;

        let expire_before = key - self.settings.rollover_expiry_ms;
        let carried = match index.last_key().and_then(|k| index.get(k)) {
            Some(prev) => self.store.rollover(prev, &snap, expire_before)?,
            None => 0,
        };

        let inserted = self.store.bulk_insert(&snap, &parsed.rows)?;

        if carried == 0 && inserted == 0 {
            self.store.dispose(snap)?;
            return Ok(parsed.stats);
        }

        index.insert(key, snap)?;

        debug!(
            family = %family,
            window_start = %clock::format_millis(key),
            carried,
            inserted,
            "request snapshot created",
        );

        Ok(parsed.stats)
    }

    fn emit(&mut self, window: Window) -> Result<Emission> {
        let mut counts = EmitCounts::default();
        let mut no_data = Vec::new();

        if self.output.contains(window.start) {
            debug!(window_start = window.start, "window already emitted");
            return Ok(Emission {
                counts,
                outcome: CommitOutcome::AlreadyCommitted,
                no_data,
                violation: None,
            });
        }

        let mut batch = MetricBatch::new(window.start);
        let mut violation = None;

        let shard_requests = self.request_view(Family::ShardRequests, window.start)?;
        let http_requests = self.request_view(Family::HttpRequests, window.start)?;

        let os = self.align_family(Family::OsThreads, window)?;
        match &os {
            Alignment::NoData(reason) => no_data.push((Family::OsThreads, *reason)),
            aligned => {
                if let Some(snap) = aligned.snapshot() {
                    let os_rows = self.store.select_aggregate(
                        snap,
                        &[TID, THREAD_NAME],
                        Stat::Avg,
                        OS_THREADS.metrics,
                    )?;

                    counts.correlated = correlate::correlate_threads(
                        &os_rows,
                        &shard_requests,
                        window,
                        &mut batch,
                    )?;
                    counts.categorized =
                        categorize::emit_categorized(&self.categorizer, &os_rows, &mut batch)?;

                    if self.settings.consistency_check {
                        violation =
                            check::check_threads(&self.store, snap, &shard_requests, window)?;
                    }
                }
            }
        }
        os.release(&self.store)?;

        if let Some(err) = &violation {
            if let Some(m) = &self.metrics {
                m.consistency_violations.inc();
            }
            if self.settings.fail_on_inconsistency {
                return Err(err.clone().into());
            }
            warn!(error = %err, "thread consistency check failed");
        }

        counts.workload = workload::emit_shard_workload(&shard_requests, &mut batch)?;
        counts.workload += workload::emit_http_workload(&http_requests, &mut batch)?;

        for family in self.settings.node_families.clone() {
            let aligned = self.align_family(family, window)?;
            match &aligned {
                Alignment::NoData(reason) => no_data.push((family, *reason)),
                other => {
                    if let Some(snap) = other.snapshot() {
                        counts.node += node::emit_node_family(&self.store, snap, &mut batch)?;
                    }
                }
            }
            aligned.release(&self.store)?;
        }

        if let Some(m) = &self.metrics {
            for (family, reason) in &no_data {
                m.windows_skipped
                    .with_label_values(&[family.as_str(), reason.as_str()])
                    .inc();
            }
        }

        let outcome = self.output.commit(&batch)?;
        if let CommitOutcome::Committed { rows } = outcome {
            debug!(window_start = window.start, rows, "output bucket committed");
            if let Some(m) = &self.metrics {
                for (procedure, n) in counts.by_procedure() {
                    m.output_rows
                        .with_label_values(&[procedure])
                        .inc_by(n as f64);
                }
                if let Some(latest) = self.output.latest() {
                    m.latest_bucket.set(latest as f64);
                }
            }
        }

        Ok(Emission {
            counts,
            outcome,
            no_data,
            violation,
        })
    }

    fn align_family(&mut self, family: Family, window: Window) -> Result<Alignment> {
        match self.sampled.get(&family) {
            Some(index) => align::align(&mut self.store, index, window),
            None => Ok(Alignment::NoData(NoData::NoLeftWindow)),
        }
    }

    fn request_view(&self, family: Family, window_start: i64) -> Result<Vec<RequestRecord>> {
        match self.requests.get(&family).and_then(|i| i.get(window_start)) {
            Some(snap) => self.store.request_view(snap),
            None => Ok(Vec::new()),
        }
    }

    fn trim_retention(&mut self, curr: i64) -> Result<()> {
        let bound = self.settings.retained_snapshots;

        for (family, index) in self.sampled.iter_mut().chain(self.requests.iter_mut()) {
            for (key, snap) in index.trim_to(bound) {
                debug!(family = %family, key, "snapshot evicted");
                self.store.dispose(snap)?;
            }
            if let Some(m) = &self.metrics {
                m.snapshots_retained
                    .with_label_values(&[family.as_str()])
                    .set(index.len() as f64);
            }
        }

        for key in self.output.trim()? {
            debug!(key, "output bucket evicted");
        }

        if let Some(horizon) = self.settings.janitor_horizon_ms {
            let cutoff = clock::floor_to(curr - horizon, self.clock.rotation_ms());
            purge_writer_buckets(&self.metrics_root, cutoff);
        }

        Ok(())
    }

    fn refresh_topology(&mut self, now: i64) {
        let Some(feed) = self.topology.as_mut() else {
            return;
        };
        if feed.refresh_if_due(now) {
            if let Some(m) = &self.metrics {
                m.topology_nodes.set(feed.handle().len() as f64);
            }
        }
    }
}

/// Run `pipeline` on its own named thread, driving waits through `handle`.
pub fn spawn(
    mut pipeline: Pipeline,
    handle: Handle,
    cancel: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name(THREAD_NAME_PIPELINE.to_string())
        .spawn(move || pipeline.run(&handle, &cancel))
        .context("spawning reader pipeline thread")
}

/// Delete writer bucket directories older than `cutoff`. Best effort: the
/// writer may be purging the same buckets.
fn purge_writer_buckets(root: &std::path::Path, cutoff: i64) -> usize {
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "janitor could not list writer root");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(bucket) = protocol::parse_bucket_name(&name) else {
            continue;
        };
        if bucket >= cutoff {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(bucket, error = %e, "janitor failed to remove writer bucket"),
        }
    }

    if removed > 0 {
        debug!(removed, cutoff, "janitor removed writer buckets");
    }

    removed
}

fn observe_parse(metrics: Option<&HealthMetrics>, family: Family, stats: ParseStats) {
    let Some(m) = metrics else {
        return;
    };
    let label = [family.as_str()];
    m.files_parsed
        .with_label_values(&label)
        .inc_by(stats.parsed as f64);
    m.files_skipped
        .with_label_values(&label)
        .inc_by(stats.skipped as f64);
    m.file_errors
        .with_label_values(&label)
        .inc_by(stats.errors as f64);
}

fn add_stats(total: &mut ParseStats, stats: ParseStats) {
    total.parsed += stats.parsed;
    total.skipped += stats.skipped;
    total.errors += stats.errors;
}

fn log_report(report: &CycleReport) {
    let outcome = match report.outcome {
        CommitOutcome::Committed { .. } => "committed",
        CommitOutcome::AlreadyCommitted => "already_committed",
        CommitOutcome::Empty => "empty",
        CommitOutcome::Stale => "stale",
    };

    info!(
        window_start = %clock::format_millis(report.window.start),
        parsed = report.parsed.parsed,
        errors = report.parsed.errors,
        rows = report.counts.total(),
        skipped_families = report.no_data.len(),
        outcome,
        "reader cycle complete",
    );
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
