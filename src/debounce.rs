//! Adaptive debounce for render requests.
//!
//! The debouncer is a plain state machine driven with explicit instants; the
//! scheduler owns the actual timer. States:
//!
//! - `Idle` --edit--> `Pending(deadline)`
//! - `Pending` --edit--> `Pending(new deadline)` (only the last edit of a burst renders)
//! - `Pending` --deadline passed--> `Rendering`
//! - `Rendering` --edit--> `Rendering { queued: true }`
//! - `Rendering` --complete--> `Idle`, or `Pending(now + min_delay)` if queued
//!
//! The delay grows with the document size bucket, the recent load sample and
//! the smoothed render latency, and is always clamped to `[min_delay, max_delay]`.

use sysinfo::System;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebounceConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub small_delay: Duration,
    pub medium_delay: Duration,
    pub large_delay: Duration,
    /// Documents at least this many bytes long are `Medium`.
    pub medium_threshold: usize,
    /// Documents at least this many bytes long are `Large`.
    pub large_threshold: usize,
    /// A load sample of 1.0 stretches the base delay by `1 + load_weight`.
    pub load_weight: f64,
    /// Fraction of the smoothed render latency added to the delay.
    pub latency_weight: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(600),
            small_delay: Duration::from_millis(40),
            medium_delay: Duration::from_millis(120),
            large_delay: Duration::from_millis(300),
            medium_threshold: 16 * 1024,
            large_threshold: 128 * 1024,
            load_weight: 1.0,
            latency_weight: 0.5,
        }
    }
}

impl DebounceConfig {
    /// Config with the given bounds and base delays pulled inside them.
    pub fn with_bounds(min_delay: Duration, max_delay: Duration) -> Self {
        let max_delay = max_delay.max(min_delay);
        let defaults = Self::default();
        let fit = |d: Duration| d.clamp(min_delay, max_delay);
        Self {
            min_delay,
            max_delay,
            small_delay: fit(defaults.small_delay),
            medium_delay: fit(defaults.medium_delay),
            large_delay: fit(defaults.large_delay),
            ..defaults
        }
    }

    pub fn bucket(&self, doc_len: usize) -> SizeBucket {
        if doc_len >= self.large_threshold {
            SizeBucket::Large
        } else if doc_len >= self.medium_threshold {
            SizeBucket::Medium
        } else {
            SizeBucket::Small
        }
    }

    fn base_delay(&self, bucket: SizeBucket) -> Duration {
        // Keep the base delays ordered even if configured out of order.
        let medium = self.medium_delay.max(self.small_delay);
        match bucket {
            SizeBucket::Small => self.small_delay,
            SizeBucket::Medium => medium,
            SizeBucket::Large => self.large_delay.max(medium),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending { deadline: Instant },
    Rendering { queued: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The timer was (re)armed for this deadline.
    Scheduled(Instant),
    /// A render is in flight; another one will follow it.
    Queued,
}

#[derive(Debug)]
pub struct AdaptiveDebouncer {
    config: DebounceConfig,
    state: DebounceState,
    bucket: SizeBucket,
    load: f64,
    last_render: Option<Duration>,
    smoothed_render: Option<Duration>,
}

impl AdaptiveDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: DebounceState::Idle,
            bucket: SizeBucket::Small,
            load: 0.0,
            last_render: None,
            smoothed_render: None,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn bucket(&self) -> SizeBucket {
        self.bucket
    }

    pub fn last_render(&self) -> Option<Duration> {
        self.last_render
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Records a load sample in `[0, 1]`; out-of-range values are clamped.
    pub fn set_load(&mut self, sample: f64) {
        self.load = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };
    }

    pub fn on_edit(&mut self, now: Instant, doc_len: usize) -> EditOutcome {
        self.bucket = self.config.bucket(doc_len);
        match self.state {
            DebounceState::Rendering { .. } => {
                self.state = DebounceState::Rendering { queued: true };
                EditOutcome::Queued
            }
            DebounceState::Idle | DebounceState::Pending { .. } => {
                let deadline = now + self.delay_for(self.bucket);
                self.state = DebounceState::Pending { deadline };
                EditOutcome::Scheduled(deadline)
            }
        }
    }

    /// Returns `true` exactly once when a pending deadline has passed; the
    /// caller must then start one render.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Pending { deadline } if now >= deadline => {
                self.state = DebounceState::Rendering { queued: false };
                true
            }
            _ => false,
        }
    }

    /// Feeds back a finished render. Returns the next deadline when an edit
    /// arrived while it was running.
    pub fn on_render_complete(&mut self, now: Instant, elapsed: Duration) -> Option<Instant> {
        self.last_render = Some(elapsed);
        self.smoothed_render = Some(match self.smoothed_render {
            Some(prev) => prev.mul_f64(0.7) + elapsed.mul_f64(0.3),
            None => elapsed,
        });
        match self.state {
            DebounceState::Rendering { queued: true } => {
                let deadline = now + self.config.min_delay;
                self.state = DebounceState::Pending { deadline };
                Some(deadline)
            }
            DebounceState::Rendering { queued: false } => {
                self.state = DebounceState::Idle;
                None
            }
            DebounceState::Idle | DebounceState::Pending { .. } => self.deadline(),
        }
    }

    pub fn delay_for(&self, bucket: SizeBucket) -> Duration {
        let cfg = &self.config;
        let stretched = cfg.base_delay(bucket).mul_f64(1.0 + self.load * cfg.load_weight.max(0.0));
        let latency = self
            .smoothed_render
            .map(|d| d.mul_f64(cfg.latency_weight.max(0.0)))
            .unwrap_or_default();
        let max = cfg.max_delay.max(cfg.min_delay);
        (stretched + latency).clamp(cfg.min_delay, max)
    }
}

/// Source of a system load sample in `[0, 1]`.
pub trait LoadProbe: Send {
    fn sample(&mut self) -> Option<f64>;
}

/// Always reports an idle system.
#[derive(Debug, Default)]
pub struct NoLoad;

impl LoadProbe for NoLoad {
    fn sample(&mut self) -> Option<f64> {
        None
    }
}

/// Global CPU utilisation sampled with `sysinfo`.
///
/// Usage is measured between consecutive refreshes, so the first sample
/// after construction covers the time since `default()`.
pub struct CpuLoad {
    system: System,
}

impl Default for CpuLoad {
    fn default() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl std::fmt::Debug for CpuLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuLoad").finish_non_exhaustive()
    }
}

impl LoadProbe for CpuLoad {
    fn sample(&mut self) -> Option<f64> {
        self.system.refresh_cpu_usage();
        usage_fraction(self.system.global_cpu_usage())
    }
}

/// Percent from `sysinfo` to a load sample in `[0, 1]`.
fn usage_fraction(percent: f32) -> Option<f64> {
    percent
        .is_finite()
        .then(|| (f64::from(percent) / 100.0).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::{
        AdaptiveDebouncer, CpuLoad, DebounceConfig, DebounceState, EditOutcome, LoadProbe, SizeBucket,
        usage_fraction,
    };
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn burst_of_edits_fires_once() {
        let mut d = AdaptiveDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();
        let mut fired = 0;
        for i in 0..10 {
            let now = t0 + ms(i * 5);
            d.on_edit(now, 100);
            if d.poll(now) {
                fired += 1;
            }
        }
        assert_eq!(fired, 0);
        let deadline = d.deadline().unwrap();
        assert!(deadline >= t0 + ms(45));
        assert!(d.poll(deadline));
        assert!(!d.poll(deadline + ms(1000)));
        assert_eq!(d.state(), DebounceState::Rendering { queued: false });
    }

    #[test]
    fn edit_during_render_is_queued() {
        let mut d = AdaptiveDebouncer::new(DebounceConfig::default());
        let t0 = Instant::now();
        d.on_edit(t0, 10);
        let deadline = d.deadline().unwrap();
        assert!(d.poll(deadline));

        assert_eq!(d.on_edit(deadline + ms(1), 10), EditOutcome::Queued);
        assert_eq!(d.on_edit(deadline + ms(2), 10), EditOutcome::Queued);
        assert!(!d.poll(deadline + ms(500)));

        let done = deadline + ms(50);
        let next = d.on_render_complete(done, ms(50)).unwrap();
        assert_eq!(next, done + ms(20));
        assert!(d.poll(next));
        assert_eq!(d.on_render_complete(next + ms(5), ms(5)), None);
        assert_eq!(d.state(), DebounceState::Idle);
    }

    #[test]
    fn bigger_documents_wait_longer() {
        let d = AdaptiveDebouncer::new(DebounceConfig::default());
        let small = d.delay_for(SizeBucket::Small);
        let medium = d.delay_for(SizeBucket::Medium);
        let large = d.delay_for(SizeBucket::Large);
        assert!(small < medium && medium < large);
    }

    #[test]
    fn load_and_latency_stretch_delay() {
        let mut d = AdaptiveDebouncer::new(DebounceConfig::default());
        let idle = d.delay_for(SizeBucket::Small);
        d.set_load(1.0);
        let loaded = d.delay_for(SizeBucket::Small);
        assert_eq!(loaded, idle * 2);

        d.set_load(0.0);
        let t0 = Instant::now();
        d.on_edit(t0, 0);
        d.poll(t0 + ms(100));
        assert_eq!(d.last_render(), None);
        d.on_render_complete(t0 + ms(200), ms(100));
        assert_eq!(d.last_render(), Some(ms(100)));
        assert_eq!(d.delay_for(SizeBucket::Small), idle + ms(50));
    }

    #[test]
    fn bucket_thresholds() {
        let cfg = DebounceConfig::default();
        assert_eq!(cfg.bucket(0), SizeBucket::Small);
        assert_eq!(cfg.bucket(cfg.medium_threshold), SizeBucket::Medium);
        assert_eq!(cfg.bucket(cfg.large_threshold + 1), SizeBucket::Large);
    }

    #[test]
    fn with_bounds_pulls_bases_inside() {
        let cfg = DebounceConfig::with_bounds(ms(50), ms(100));
        assert_eq!(cfg.small_delay, ms(50));
        assert_eq!(cfg.medium_delay, ms(100));
        assert_eq!(cfg.large_delay, ms(100));
    }

    #[test]
    fn cpu_usage_maps_to_unit_range() {
        assert_eq!(usage_fraction(50.0), Some(0.5));
        assert_eq!(usage_fraction(250.0), Some(1.0));
        assert_eq!(usage_fraction(-3.0), Some(0.0));
        assert_eq!(usage_fraction(f32::NAN), None);
    }

    #[test]
    fn cpu_load_samples_within_bounds() {
        let mut cpu = CpuLoad::default();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        if let Some(load) = cpu.sample() {
            assert!((0.0..=1.0).contains(&load));
        }
    }

    proptest! {
        #[test]
        fn delay_stays_in_bounds_and_grows_with_size(
            min in 0u64..200,
            span in 0u64..2000,
            load in -1.0f64..3.0,
            latency in 0u64..5000,
        ) {
            let cfg = DebounceConfig {
                min_delay: ms(min),
                max_delay: ms(min + span),
                ..DebounceConfig::default()
            };
            let mut d = AdaptiveDebouncer::new(cfg.clone());
            d.set_load(load);
            let t0 = Instant::now();
            d.on_edit(t0, 0);
            d.poll(t0 + ms(1000));
            d.on_render_complete(t0 + ms(1000), ms(latency));

            let mut prev = Duration::ZERO;
            for bucket in [SizeBucket::Small, SizeBucket::Medium, SizeBucket::Large] {
                let delay = d.delay_for(bucket);
                prop_assert!(delay >= cfg.min_delay && delay <= cfg.max_delay);
                prop_assert!(delay >= prev);
                prev = delay;
            }
        }
    }
}
