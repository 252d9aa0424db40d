//! One render pass: split, pick a strategy, assemble the page.

use crate::block::Splitter;
use crate::cache::BlockCache;
use crate::html::DocumentShell;
use crate::render::parallel::DEFAULT_PARALLEL_THRESHOLD;
use crate::render::pool::{MAX_WORKERS, default_worker_count};
use crate::render::{
    BlockRender, Fragment, RenderError, RenderStats, RendererFactory, WorkerPool, render_parallel,
    render_sequential,
};
use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub splitter: Splitter,
    pub shell: DocumentShell,
    /// Pool size; 0 or 1 renders everything on the calling thread.
    pub workers: usize,
    /// Minimum number of distinct cache misses before the pool is used.
    pub parallel_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            splitter: Splitter::default(),
            shell: DocumentShell::default(),
            workers: default_worker_count(MAX_WORKERS),
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub html: String,
    pub title: Option<String>,
    pub fragments: Vec<Fragment>,
    pub stats: RenderStats,
}

impl RenderedDocument {
    /// Some blocks failed and are shown as plain source.
    pub fn is_partial(&self) -> bool {
        self.stats.fallbacks > 0
    }
}

pub struct RenderEngine {
    options: EngineOptions,
    cache: Arc<BlockCache>,
    factory: Arc<dyn RendererFactory>,
    pool: Option<WorkerPool>,
    local: Option<Box<dyn BlockRender>>,
}

impl RenderEngine {
    pub fn new(
        options: EngineOptions,
        factory: Arc<dyn RendererFactory>,
        cache: Arc<BlockCache>,
    ) -> io::Result<Self> {
        let pool = start_pool(options.workers, &factory)?;
        Ok(Self {
            options,
            cache,
            factory,
            pool,
            local: None,
        })
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn backend(&self) -> &str {
        self.factory.name()
    }

    pub fn render(&mut self, text: &str) -> RenderedDocument {
        let blocks = self.options.splitter.split(text);
        let title = blocks
            .iter()
            .filter_map(|b| b.heading.as_ref())
            .find(|h| h.level == 0)
            .map(|h| h.title.clone());

        if self.local.is_none() {
            match self.factory.create() {
                Ok(renderer) => self.local = Some(renderer),
                Err(err) => tracing::warn!(
                    target: "adocview::render",
                    backend = self.factory.name(),
                    error = %err,
                    "could not create renderer"
                ),
            }
        }
        let mut unavailable = Unavailable;
        let local: &mut dyn BlockRender = match self.local.as_mut() {
            Some(renderer) => renderer.as_mut(),
            None => &mut unavailable,
        };

        let output = match &self.pool {
            Some(pool) => render_parallel(
                &blocks,
                &self.cache,
                pool,
                local,
                self.options.parallel_threshold,
            ),
            None => render_sequential(&blocks, &self.cache, local),
        };

        let html = self.options.shell.assemble(title.as_deref(), &output.fragments);
        RenderedDocument {
            html,
            title,
            fragments: output.fragments,
            stats: output.stats,
        }
    }

    /// Swaps the backend. Cached fragments came from the old backend, so the
    /// cache is cleared and every thread gets a fresh renderer.
    pub fn reconfigure(&mut self, factory: Arc<dyn RendererFactory>) -> io::Result<()> {
        self.pool = None;
        self.local = None;
        self.pool = start_pool(self.options.workers, &factory)?;
        self.factory = factory;
        self.cache.clear();
        Ok(())
    }

    /// Page chrome lives outside the cached fragments; no invalidation needed.
    pub fn set_shell(&mut self, shell: DocumentShell) {
        self.options.shell = shell;
    }
}

fn start_pool(
    workers: usize,
    factory: &Arc<dyn RendererFactory>,
) -> io::Result<Option<WorkerPool>> {
    if workers <= 1 {
        return Ok(None);
    }
    WorkerPool::new(workers, Arc::clone(factory)).map(Some)
}

/// Stand-in when the backend cannot be created; every miss falls back.
struct Unavailable;

impl BlockRender for Unavailable {
    fn render(&mut self, _source: &str) -> Result<String, RenderError> {
        Err(RenderError::Backend("renderer unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineOptions, RenderEngine};
    use crate::block::Splitter;
    use crate::cache::BlockCache;
    use crate::html::DocumentShell;
    use crate::render::testing::CountingFactory;
    use crate::render::{BlockRender, FragmentOrigin, RenderError, RendererFactory};
    use std::sync::Arc;

    fn engine(factory: &CountingFactory, workers: usize) -> RenderEngine {
        let options = EngineOptions {
            workers,
            ..EngineOptions::default()
        };
        let cache = Arc::new(BlockCache::new(64).unwrap());
        RenderEngine::new(options, Arc::new(factory.clone()), cache).unwrap()
    }

    #[test]
    fn rendering_twice_is_idempotent_and_free() {
        for workers in [0, 4] {
            let factory = CountingFactory::default();
            let mut engine = engine(&factory, workers);
            let doc = "= Title\n\nPara one.\n\n== Section\n\nPara two.";
            let first = engine.render(doc);
            let calls = factory.calls();
            let second = engine.render(doc);
            assert_eq!(first.html, second.html);
            assert_eq!(factory.calls(), calls);
            assert_eq!(second.stats.cache_hits, 2);
            assert_eq!(first.title.as_deref(), Some("Title"));
            assert!(first.html.contains("<title>Title</title>"));
        }
    }

    #[test]
    fn large_edit_uses_pool() {
        let factory = CountingFactory::default();
        let mut engine = engine(&factory, 3);
        let doc: String = (0..10).map(|i| format!("== S{i}\n")).collect();
        let out = engine.render(&doc);
        assert!(out.stats.parallel());
        assert_eq!(out.fragments.len(), 10);
    }

    #[test]
    fn reconfigure_clears_cache() {
        let factory = CountingFactory::default();
        let mut engine = engine(&factory, 0);
        engine.render("== A\n");
        assert_eq!(engine.cache().len(), 1);

        let other = CountingFactory::default();
        engine.reconfigure(Arc::new(other.clone())).unwrap();
        assert!(engine.cache().is_empty());
        engine.render("== A\n");
        assert_eq!(other.calls(), 1);
        assert_eq!(engine.backend(), "counting");
    }

    #[test]
    fn failed_backend_creation_falls_back_per_block() {
        struct Broken;
        impl RendererFactory for Broken {
            fn create(&self) -> Result<Box<dyn BlockRender>, RenderError> {
                Err(RenderError::Backend("not installed".to_string()))
            }
        }
        let mut engine = RenderEngine::new(
            EngineOptions {
                workers: 0,
                ..EngineOptions::default()
            },
            Arc::new(Broken),
            Arc::new(BlockCache::new(8).unwrap()),
        )
        .unwrap();
        let out = engine.render("== A\n<b>\n");
        assert!(out.is_partial());
        assert_eq!(out.fragments[0].origin, FragmentOrigin::Fallback);
        assert!(out.html.contains("&lt;b&gt;"));
    }

    #[test]
    fn shell_and_splitter_come_from_options() {
        let factory = CountingFactory::default();
        let options = EngineOptions {
            workers: 0,
            splitter: Splitter::new(crate::block::Dialect::Markdown, 1),
            shell: DocumentShell::new("notes", ".x { color: red; }"),
            ..EngineOptions::default()
        };
        let cache = Arc::new(BlockCache::new(8).unwrap());
        let mut engine = RenderEngine::new(options, Arc::new(factory.clone()), cache).unwrap();
        let out = engine.render("# Top\n## Sub\n### Deep\n");
        assert_eq!(out.fragments.len(), 2);
        assert!(out.html.contains(".x { color: red; }"));
        assert!(out.html.contains("<title>Top</title>"));
    }
}
