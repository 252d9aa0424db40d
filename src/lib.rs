//! Incremental, block-based HTML preview for AsciiDoc documents.
//!
//! Text is split into blocks at section headings, each block is keyed by the
//! SHA-256 of its source, and only blocks missing from a bounded LRU cache are
//! sent to the renderer backend, optionally fanned out over a worker pool.
//! [`RenderScheduler`] wraps this in an adaptive debounce so an editor can
//! call it on every keystroke.

pub mod block;
pub mod cache;
pub mod debounce;
pub mod engine;
pub mod hash;
pub mod html;
pub mod render;
pub mod scheduler;
pub mod telemetry;

pub use block::{Block, Dialect, Splitter, split};
pub use cache::{BlockCache, CacheError, CacheStats};
pub use debounce::{AdaptiveDebouncer, DebounceConfig, CpuLoad, LoadProbe};
pub use engine::{EngineOptions, RenderEngine, RenderedDocument};
pub use hash::ContentHash;
pub use html::DocumentShell;
pub use render::{BlockRender, RenderError, RendererFactory};
pub use scheduler::{
    JobError, JobId, LatestResult, RenderEvent, RenderScheduler, RenderedPreview, SchedulerError,
    SchedulerOptions,
};
pub use telemetry::TelemetrySnapshot;
