//! Non-blocking render orchestration for one open document.
//!
//! [`RenderScheduler`] runs two threads. The coordinator owns the debouncer,
//! the job counter and the latest pending text; it is the only place those
//! are touched. The render thread owns the [`RenderEngine`] (and through it
//! the worker pool) and executes one job at a time. `request_render` only
//! sends a message, so callers never block on rendering.

use crate::cache::{BlockCache, CacheError};
use crate::debounce::{AdaptiveDebouncer, DebounceConfig, LoadProbe, NoLoad};
use crate::engine::{EngineOptions, RenderEngine, RenderedDocument};
use crate::html::DocumentShell;
use crate::render::{RenderStats, RendererFactory, panic_message};
use crate::telemetry::{TelemetryCounters, TelemetrySnapshot};
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type JobId = u64;

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("render job panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to start {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("render thread exited during startup")]
    Startup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub cache_capacity: usize,
    pub engine: EngineOptions,
    pub debounce: DebounceConfig,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            engine: EngineOptions::default(),
            debounce: DebounceConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPreview {
    pub job_id: JobId,
    pub html: String,
    pub title: Option<String>,
    pub duration: Duration,
    pub stats: RenderStats,
}

impl RenderedPreview {
    /// Some blocks are shown as escaped source because their render failed.
    pub fn is_partial(&self) -> bool {
        self.stats.fallbacks > 0
    }
}

#[derive(Debug, Clone)]
pub enum RenderEvent {
    Rendered(RenderedPreview),
    /// The whole job failed; keep showing the previous result.
    Failed { job_id: JobId, error: JobError },
}

impl RenderEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            RenderEvent::Rendered(preview) => preview.job_id,
            RenderEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Last-write-wins filter for results that may arrive out of order.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestResult {
    newest: Option<JobId>,
}

impl LatestResult {
    /// Returns `true` if `job_id` is newer than everything accepted so far.
    pub fn accept(&mut self, job_id: JobId) -> bool {
        if self.newest.is_some_and(|newest| job_id <= newest) {
            return false;
        }
        self.newest = Some(job_id);
        true
    }

    pub fn newest(&self) -> Option<JobId> {
        self.newest
    }
}

pub type EventSink = Box<dyn FnMut(RenderEvent) + Send>;

enum Command {
    Edit(String),
    Control(Control),
    Finished(JobResult),
    Shutdown,
}

enum Control {
    Invalidate,
    Reconfigure(Arc<dyn RendererFactory>),
    SetShell(DocumentShell),
}

enum RenderCommand {
    Job { job_id: JobId, text: String },
    Control(Control),
}

struct JobResult {
    job_id: JobId,
    elapsed: Duration,
    outcome: Result<RenderedDocument, JobError>,
}

pub struct RenderScheduler {
    commands: mpsc::Sender<Command>,
    coordinator: Option<thread::JoinHandle<()>>,
    cache: Arc<BlockCache>,
    telemetry: Arc<TelemetryCounters>,
}

impl RenderScheduler {
    pub fn spawn(
        options: SchedulerOptions,
        factory: Arc<dyn RendererFactory>,
        sink: impl FnMut(RenderEvent) + Send + 'static,
    ) -> Result<Self, SchedulerError> {
        Self::spawn_with_probe(options, factory, Box::new(NoLoad), Box::new(sink))
    }

    /// Like [`spawn`](Self::spawn), delivering events on a channel.
    pub fn with_channel(
        options: SchedulerOptions,
        factory: Arc<dyn RendererFactory>,
    ) -> Result<(Self, mpsc::Receiver<RenderEvent>), SchedulerError> {
        let (tx, rx) = mpsc::channel();
        let scheduler = Self::spawn(options, factory, move |event| {
            let _ = tx.send(event);
        })?;
        Ok((scheduler, rx))
    }

    pub fn spawn_with_probe(
        options: SchedulerOptions,
        factory: Arc<dyn RendererFactory>,
        probe: Box<dyn LoadProbe>,
        sink: EventSink,
    ) -> Result<Self, SchedulerError> {
        let cache = Arc::new(BlockCache::new(options.cache_capacity)?);
        let telemetry = Arc::new(TelemetryCounters::default());
        let (commands, inbox) = mpsc::channel::<Command>();
        let (jobs, job_inbox) = mpsc::channel::<RenderCommand>();

        // The engine holds renderers that are not `Send`, so it is built on
        // the render thread; startup errors come back over `ready`.
        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();
        let render_handle = {
            let cache = Arc::clone(&cache);
            let done = commands.clone();
            let engine_options = options.engine.clone();
            thread::Builder::new()
                .name("adocview-render".to_string())
                .spawn(move || match RenderEngine::new(engine_options, factory, cache) {
                    Ok(engine) => {
                        let _ = ready_tx.send(Ok(()));
                        run_renderer(engine, job_inbox, done);
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                })
                .map_err(|source| SchedulerError::Spawn { what: "render", source })?
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = render_handle.join();
                return Err(SchedulerError::Spawn { what: "worker", source });
            }
            Err(_) => {
                let _ = render_handle.join();
                return Err(SchedulerError::Startup);
            }
        }

        let coordinator = Coordinator {
            debouncer: AdaptiveDebouncer::new(options.debounce),
            probe,
            sink,
            jobs,
            render_handle: Some(render_handle),
            telemetry: Arc::clone(&telemetry),
            latest_text: None,
            next_job: 0,
            delivered: LatestResult::default(),
        };
        let coordinator = thread::Builder::new()
            .name("adocview-scheduler".to_string())
            .spawn(move || coordinator.run(inbox))
            .map_err(|source| SchedulerError::Spawn {
                what: "scheduler",
                source,
            })?;

        Ok(Self {
            commands,
            coordinator: Some(coordinator),
            cache,
            telemetry,
        })
    }

    /// Records the current document text. Returns immediately; the render
    /// starts once the debounce window closes.
    pub fn request_render(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Edit(text.into()));
    }

    /// Drops every cached fragment before the next job runs.
    pub fn invalidate_cache(&self) {
        let _ = self.commands.send(Command::Control(Control::Invalidate));
    }

    /// Switches backend; the cache is cleared with it.
    pub fn reconfigure(&self, factory: Arc<dyn RendererFactory>) {
        let _ = self.commands.send(Command::Control(Control::Reconfigure(factory)));
    }

    pub fn set_shell(&self, shell: DocumentShell) {
        let _ = self.commands.send(Command::Control(Control::SetShell(shell)));
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot(self.cache.stats())
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
    }
}

struct Coordinator {
    debouncer: AdaptiveDebouncer,
    probe: Box<dyn LoadProbe>,
    sink: EventSink,
    jobs: mpsc::Sender<RenderCommand>,
    render_handle: Option<thread::JoinHandle<()>>,
    telemetry: Arc<TelemetryCounters>,
    latest_text: Option<String>,
    next_job: JobId,
    delivered: LatestResult,
}

impl Coordinator {
    fn run(mut self, inbox: mpsc::Receiver<Command>) {
        loop {
            let message = match self.debouncer.deadline() {
                Some(deadline) => {
                    match inbox.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(message) => Some(message),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inbox.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                },
            };

            match message {
                Some(Command::Edit(text)) => {
                    let len = text.len();
                    self.latest_text = Some(text);
                    self.debouncer.on_edit(Instant::now(), len);
                }
                Some(Command::Finished(result)) => self.finish(result),
                Some(Command::Control(control)) => {
                    if self.jobs.send(RenderCommand::Control(control)).is_err() {
                        break;
                    }
                }
                Some(Command::Shutdown) => break,
                None => {}
            }

            if self.debouncer.poll(Instant::now()) && !self.dispatch() {
                break;
            }
        }
        self.shutdown();
    }

    fn dispatch(&mut self) -> bool {
        let Some(text) = self.latest_text.take() else {
            // Nothing changed since the last job.
            self.debouncer.on_render_complete(Instant::now(), Duration::ZERO);
            return true;
        };
        if let Some(load) = self.probe.sample() {
            self.debouncer.set_load(load);
        }
        self.next_job += 1;
        let job_id = self.next_job;
        self.telemetry.job_dispatched();
        tracing::debug!(
            target: "adocview::scheduler",
            job_id,
            bytes = text.len(),
            bucket = ?self.debouncer.bucket(),
            "dispatching render"
        );
        self.jobs.send(RenderCommand::Job { job_id, text }).is_ok()
    }

    fn finish(&mut self, result: JobResult) {
        self.debouncer.on_render_complete(Instant::now(), result.elapsed);

        if !self.delivered.accept(result.job_id) {
            self.telemetry.job_discarded();
            tracing::debug!(
                target: "adocview::scheduler",
                job_id = result.job_id,
                "discarding stale result"
            );
            return;
        }

        let event = match result.outcome {
            Ok(doc) => {
                self.telemetry.job_completed(&doc.stats, result.elapsed);
                RenderEvent::Rendered(RenderedPreview {
                    job_id: result.job_id,
                    html: doc.html,
                    title: doc.title,
                    duration: result.elapsed,
                    stats: doc.stats,
                })
            }
            Err(error) => {
                self.telemetry.job_failed(result.elapsed);
                tracing::error!(
                    target: "adocview::scheduler",
                    job_id = result.job_id,
                    %error,
                    "render job failed"
                );
                RenderEvent::Failed {
                    job_id: result.job_id,
                    error,
                }
            }
        };
        (self.sink)(event);
    }

    fn shutdown(self) {
        // Closing the job channel lets the render thread exit after its
        // current job.
        let Coordinator { jobs, render_handle, .. } = self;
        drop(jobs);
        if let Some(handle) = render_handle {
            let _ = handle.join();
        }
    }
}

fn run_renderer(
    mut engine: RenderEngine,
    inbox: mpsc::Receiver<RenderCommand>,
    done: mpsc::Sender<Command>,
) {
    for command in inbox {
        match command {
            RenderCommand::Job { job_id, text } => {
                let started = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| engine.render(&text)))
                    .map_err(|payload| JobError::Panicked(panic_message(payload.as_ref())));
                let result = JobResult {
                    job_id,
                    elapsed: started.elapsed(),
                    outcome,
                };
                if done.send(Command::Finished(result)).is_err() {
                    break;
                }
            }
            RenderCommand::Control(Control::Invalidate) => engine.cache().clear(),
            RenderCommand::Control(Control::Reconfigure(factory)) => {
                let backend = factory.name().to_string();
                match engine.reconfigure(factory) {
                    Ok(()) => tracing::info!(
                        target: "adocview::scheduler",
                        %backend,
                        "renderer reconfigured"
                    ),
                    Err(err) => tracing::warn!(
                        target: "adocview::scheduler",
                        %backend,
                        error = %err,
                        "reconfigure failed"
                    ),
                }
            }
            RenderCommand::Control(Control::SetShell(shell)) => engine.set_shell(shell),
        }
    }
}
