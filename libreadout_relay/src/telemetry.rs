use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use fxhash::FxHashMap;

use super::constants::MAX_CHANNELS;

const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(10);

/// The thread a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Ingest,
    Worker(usize),
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::Worker(id) => write!(f, "worker {id}"),
        }
    }
}

#[derive(Debug, Default)]
struct ScopeCounters {
    events: AtomicU64,
    bytes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default)]
struct CrcTally {
    passed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug)]
struct Ledger {
    runs: FxHashMap<Scope, u32>,
    failures: FxHashMap<(Scope, &'static str), u64>,
    last_report: Instant,
    last_events: u64,
    last_bytes: u64,
}

/// Counters shared by the ingest thread and the workers.
///
/// Per-event counters are atomics. The failure ledger sits behind a lock that is
/// only taken on failures, run changes and reports.
#[derive(Debug)]
pub struct Telemetry {
    scopes: Vec<ScopeCounters>,
    crc: Vec<CrcTally>,
    reduced: AtomicU64,
    soft_corrections: AtomicU64,
    reports: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl Telemetry {
    pub fn new(n_workers: usize) -> Self {
        Self {
            scopes: (0..n_workers + 1).map(|_| ScopeCounters::default()).collect(),
            crc: (0..(n_workers + 1) * MAX_CHANNELS)
                .map(|_| CrcTally::default())
                .collect(),
            reduced: AtomicU64::new(0),
            soft_corrections: AtomicU64::new(0),
            reports: AtomicU64::new(0),
            ledger: Mutex::new(Ledger {
                runs: FxHashMap::default(),
                failures: FxHashMap::default(),
                last_report: Instant::now(),
                last_events: 0,
                last_bytes: 0,
            }),
        }
    }

    pub fn n_workers(&self) -> usize {
        self.scopes.len() - 1
    }

    fn counters(&self, scope: Scope) -> Option<&ScopeCounters> {
        self.scope_index(scope).and_then(|idx| self.scopes.get(idx))
    }

    fn scope_index(&self, scope: Scope) -> Option<usize> {
        match scope {
            Scope::Ingest => Some(0),
            Scope::Worker(id) if id < self.n_workers() => Some(id + 1),
            Scope::Worker(_) => None,
        }
    }

    fn tally(&self, scope: Scope, channel: usize) -> Option<&CrcTally> {
        if channel >= MAX_CHANNELS {
            return None;
        }
        self.scope_index(scope)
            .and_then(|idx| self.crc.get(idx * MAX_CHANNELS + channel))
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_event(&self, scope: Scope, bytes: usize) {
        if let Some(counters) = self.counters(scope) {
            counters.events.fetch_add(1, Ordering::Relaxed);
            counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn record_crc(&self, scope: Scope, channel: usize, passed: bool) {
        if let Some(tally) = self.tally(scope, channel) {
            if passed {
                tally.passed.fetch_add(1, Ordering::Relaxed);
            } else {
                tally.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_failure(&self, scope: Scope, kind: &'static str) {
        if let Some(counters) = self.counters(scope) {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        *self.ledger().failures.entry((scope, kind)).or_insert(0) += 1;
    }

    pub fn record_reduction(&self) {
        self.reduced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_soft_correction(&self) {
        self.soft_corrections.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero a scope's error and CRC counters when it first sees a new run.
    ///
    /// Repeated reports of the same run are ignored. Returns true if the counters
    /// were reset.
    pub fn reset_for_run(&self, scope: Scope, run: u32) -> bool {
        let Some(idx) = self.scope_index(scope) else {
            return false;
        };
        let mut ledger = self.ledger();
        if ledger.runs.insert(scope, run) == Some(run) {
            return false;
        }
        ledger.failures.retain(|(s, _), _| *s != scope);
        for tally in self.crc[idx * MAX_CHANNELS..(idx + 1) * MAX_CHANNELS].iter() {
            tally.passed.store(0, Ordering::Relaxed);
            tally.failed.store(0, Ordering::Relaxed);
        }
        self.scopes[idx].failures.store(0, Ordering::Relaxed);
        true
    }

    /// The run most recently seen by a scope
    pub fn run(&self, scope: Scope) -> Option<u32> {
        self.ledger().runs.get(&scope).copied()
    }

    pub fn events(&self, scope: Scope) -> u64 {
        self.counters(scope)
            .map_or(0, |c| c.events.load(Ordering::Relaxed))
    }

    pub fn bytes(&self, scope: Scope) -> u64 {
        self.counters(scope)
            .map_or(0, |c| c.bytes.load(Ordering::Relaxed))
    }

    pub fn failures_in(&self, scope: Scope) -> u64 {
        self.counters(scope)
            .map_or(0, |c| c.failures.load(Ordering::Relaxed))
    }

    /// Failures of one kind summed over every scope
    pub fn failures(&self, kind: &str) -> u64 {
        self.ledger()
            .failures
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, count)| *count)
            .sum()
    }

    /// (passed, failed) CRC checks for a channel, as seen by one scope
    pub fn crc_counts(&self, scope: Scope, channel: usize) -> (u64, u64) {
        self.tally(scope, channel).map_or((0, 0), |tally| {
            (
                tally.passed.load(Ordering::Relaxed),
                tally.failed.load(Ordering::Relaxed),
            )
        })
    }

    pub fn reduced(&self) -> u64 {
        self.reduced.load(Ordering::Relaxed)
    }

    pub fn soft_corrections(&self) -> u64 {
        self.soft_corrections.load(Ordering::Relaxed)
    }

    /// Number of status reports logged so far
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    fn sent_totals(&self) -> (u64, u64) {
        (0..self.n_workers()).fold((0, 0), |(events, bytes), id| {
            (
                events + self.events(Scope::Worker(id)),
                bytes + self.bytes(Scope::Worker(id)),
            )
        })
    }

    /// Log a status report: rates since the previous report, then per worker and
    /// per channel totals, then failure counts.
    pub fn report(&self) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        let (events, bytes) = self.sent_totals();
        let mut ledger = self.ledger();
        let elapsed = ledger.last_report.elapsed().as_secs_f64().max(1e-3);
        let rate = (events - ledger.last_events) as f64 / elapsed;
        let throughput = (bytes - ledger.last_bytes) as f64 / elapsed;
        ledger.last_report = Instant::now();
        ledger.last_events = events;
        ledger.last_bytes = bytes;

        spdlog::info!(
            "run {:#x} -- sent {} events ({}) -- rate {:.1} Hz -- throughput {}/s -- reduced {} -- soft-corrected fragments {}",
            ledger.runs.get(&Scope::Ingest).copied().unwrap_or(0),
            events,
            human_bytes::human_bytes(bytes as f64),
            rate,
            human_bytes::human_bytes(throughput),
            self.reduced(),
            self.soft_corrections()
        );
        for id in 0..self.n_workers() {
            let scope = Scope::Worker(id);
            spdlog::info!(
                "{} -- events {} -- bytes {} -- failures {}",
                scope,
                self.events(scope),
                human_bytes::human_bytes(self.bytes(scope) as f64),
                self.failures_in(scope)
            );
        }
        for channel in 0..MAX_CHANNELS {
            let (passed, failed) = self.crc_counts(Scope::Ingest, channel);
            let failed_in_workers: u64 = (0..self.n_workers())
                .map(|id| self.crc_counts(Scope::Worker(id), channel).1)
                .sum();
            if passed + failed + failed_in_workers > 0 {
                spdlog::info!(
                    "channel {channel} -- crc ok {passed} -- crc failed {failed} -- failed in workers {failed_in_workers}"
                );
            }
        }
        let mut failures: Vec<_> = ledger.failures.iter().collect();
        failures.sort();
        for ((scope, kind), count) in failures {
            spdlog::warn!("{scope} -- {kind} failures: {count}");
        }
    }
}

/// Background thread that logs a telemetry report every interval, whether or not
/// the ingest loop is making progress. Stops and joins when dropped.
pub struct Reporter {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    pub fn spawn(telemetry: Arc<Telemetry>, interval: Duration) -> std::io::Result<Self> {
        let interval = interval.max(MIN_REPORT_INTERVAL);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(String::from("telemetry"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => telemetry.report(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                spdlog::error!("Telemetry reporter panicked");
            }
        }
    }
}
