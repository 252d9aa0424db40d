//! Block renderers and the strategies that drive them.
//!
//! A [`BlockRender`] turns one block of markup into an HTML fragment. It takes
//! `&mut self` and is not required to be `Send`: backends are free to keep
//! per-instance state, so every thread that renders gets its own instance
//! from a [`RendererFactory`].

pub mod asciidoctor;
pub mod markdown;
pub mod parallel;
pub mod pool;
pub mod sequential;

use crate::block::Block;
use crate::cache::BlockCache;
use crate::hash::ContentHash;
use crate::html::fallback_html;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use parallel::render_parallel;
pub use pool::WorkerPool;
pub use sequential::render_sequential;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start renderer `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("renderer I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("renderer exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("renderer produced invalid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("renderer panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Backend(String),
}

pub trait BlockRender {
    fn render(&mut self, source: &str) -> Result<String, RenderError>;
}

impl<F> BlockRender for F
where
    F: FnMut(&str) -> Result<String, RenderError>,
{
    fn render(&mut self, source: &str) -> Result<String, RenderError> {
        self(source)
    }
}

pub trait RendererFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn BlockRender>, RenderError>;

    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> RendererFactory for F
where
    F: Fn() -> Box<dyn BlockRender> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn BlockRender>, RenderError> {
        Ok(self())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOrigin {
    Cached,
    Rendered,
    /// The renderer failed; the fragment is escaped source text.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub index: usize,
    pub hash: ContentHash,
    pub html: Arc<str>,
    pub origin: FragmentOrigin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub blocks: usize,
    pub cache_hits: usize,
    pub rendered: usize,
    pub fallbacks: usize,
    /// Worker threads used; 0 for the sequential path.
    pub workers: usize,
    pub duration: Duration,
}

impl RenderStats {
    pub fn parallel(&self) -> bool {
        self.workers > 0
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub fragments: Vec<Fragment>,
    pub stats: RenderStats,
}

impl RenderOutput {
    pub fn has_fallbacks(&self) -> bool {
        self.stats.fallbacks > 0
    }
}

/// Runs the renderer with panics contained to this call.
pub(crate) fn render_guarded(
    renderer: &mut dyn BlockRender,
    source: &str,
) -> Result<String, RenderError> {
    match catch_unwind(AssertUnwindSafe(|| renderer.render(source))) {
        Ok(result) => result,
        Err(payload) => Err(RenderError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Creates a renderer, turning a panicking factory into an error.
pub(crate) fn create_guarded(
    factory: &dyn RendererFactory,
) -> Result<Box<dyn BlockRender>, RenderError> {
    match catch_unwind(AssertUnwindSafe(|| factory.create())) {
        Ok(result) => result,
        Err(payload) => Err(RenderError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Turns one block's render result into a fragment, caching successes.
///
/// Failures are logged and replaced by escaped source. They are not cached so
/// a later render of the same content retries the backend.
pub(crate) fn settle(
    block: &Block,
    result: Result<String, RenderError>,
    cache: &BlockCache,
    stats: &mut RenderStats,
) -> Fragment {
    match result {
        Ok(html) => {
            let html: Arc<str> = Arc::from(html);
            cache.put(block.content_hash, Arc::clone(&html));
            stats.rendered += 1;
            Fragment {
                index: block.index,
                hash: block.content_hash,
                html,
                origin: FragmentOrigin::Rendered,
            }
        }
        Err(err) => {
            tracing::warn!(
                target: "adocview::render",
                block = block.index,
                hash = %block.content_hash.short(),
                error = %err,
                "block render failed, showing source"
            );
            stats.fallbacks += 1;
            Fragment {
                index: block.index,
                hash: block.content_hash,
                html: Arc::from(fallback_html(&block.raw_text)),
                origin: FragmentOrigin::Fallback,
            }
        }
    }
}

pub(crate) fn cached_fragment(block: &Block, html: Arc<str>) -> Fragment {
    Fragment {
        index: block.index,
        hash: block.content_hash,
        html,
        origin: FragmentOrigin::Cached,
    }
}
