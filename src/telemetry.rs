use crate::cache::CacheStats;
use crate::render::RenderStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared between the scheduler threads and its handle.
#[derive(Debug, Default)]
pub(crate) struct TelemetryCounters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    blocks_rendered: AtomicU64,
    fallbacks: AtomicU64,
    parallel_jobs: AtomicU64,
    last_render_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Results that arrived after a newer one and were dropped.
    pub jobs_discarded: u64,
    pub blocks_rendered: u64,
    pub fallbacks: u64,
    pub parallel_jobs: u64,
    pub last_render: Option<Duration>,
    pub cache: CacheStats,
}

impl TelemetryCounters {
    pub(crate) fn job_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_completed(&self, stats: &RenderStats, elapsed: Duration) {
        use Ordering::Relaxed;
        self.completed.fetch_add(1, Relaxed);
        self.blocks_rendered.fetch_add(stats.rendered as u64, Relaxed);
        self.fallbacks.fetch_add(stats.fallbacks as u64, Relaxed);
        if stats.parallel() {
            self.parallel_jobs.fetch_add(1, Relaxed);
        }
        self.record_duration(elapsed);
    }

    pub(crate) fn job_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(elapsed);
    }

    pub(crate) fn job_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, elapsed: Duration) {
        // Stored +1 so zero means "no render yet".
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX - 1);
        self.last_render_micros.store(micros + 1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, cache: CacheStats) -> TelemetrySnapshot {
        use Ordering::Relaxed;
        let last = self.last_render_micros.load(Relaxed);
        TelemetrySnapshot {
            jobs_dispatched: self.dispatched.load(Relaxed),
            jobs_completed: self.completed.load(Relaxed),
            jobs_failed: self.failed.load(Relaxed),
            jobs_discarded: self.discarded.load(Relaxed),
            blocks_rendered: self.blocks_rendered.load(Relaxed),
            fallbacks: self.fallbacks.load(Relaxed),
            parallel_jobs: self.parallel_jobs.load(Relaxed),
            last_render: (last > 0).then(|| Duration::from_micros(last - 1)),
            cache,
        }
    }
}
