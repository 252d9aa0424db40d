use crate::config::{self, Backend, Config};
use crate::theme::ThemeManager;
use adocview::cache::BlockCache;
use adocview::debounce::CpuLoad;
use adocview::engine::{RenderEngine, RenderedDocument};
use adocview::render::RendererFactory;
use adocview::render::asciidoctor::AsciidoctorFactory;
use adocview::render::markdown::MarkdownFactory;
use adocview::scheduler::{JobId, LatestResult, RenderEvent, RenderScheduler, SchedulerOptions};
use anyhow::{Context, Result};
use notify::{EventKind, RecursiveMode, Watcher};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use syntect::parsing::SyntaxSet;

/// Quiet period after a filesystem event before the file is read again.
const FS_SETTLE: Duration = Duration::from_millis(150);

/// Everything the render pipeline is built from, resolved for one file.
#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    backend: Backend,
    theme: String,
    asciidoctor_command: String,
    options: SchedulerOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    None,
    /// Only the page chrome changed.
    Shell,
    /// Renderer output changes; cached fragments are stale.
    Renderer,
    /// Splitting, cache size or pool size changed; start a new scheduler.
    Restart,
}

impl Pipeline {
    fn resolve(
        path: &Path,
        config: &Config,
        themes: &ThemeManager,
        backend: Option<Backend>,
    ) -> Self {
        let backend = backend.unwrap_or(config.backend).resolve(path);
        let theme = if themes.contains(&config.theme) {
            config.theme.clone()
        } else {
            tracing::warn!(
                target: "adocview::preview",
                theme = %config.theme,
                fallback = themes.fallback_name(),
                "unknown theme"
            );
            themes.fallback_name().to_string()
        };
        let shell = themes.shell(&theme, &display_name(path));
        Self {
            backend,
            theme,
            asciidoctor_command: config.asciidoctor_command.clone(),
            options: config.scheduler_options(backend.dialect(), shell),
        }
    }

    fn change_from(&self, old: &Pipeline) -> Change {
        let mut a = self.options.clone();
        let mut b = old.options.clone();
        a.engine.shell = Default::default();
        b.engine.shell = Default::default();
        if a != b {
            return Change::Restart;
        }
        let renderer_changed = self.backend != old.backend
            || self.asciidoctor_command != old.asciidoctor_command
            // Highlighted code embeds theme colours.
            || (self.backend == Backend::Markdown && self.theme != old.theme);
        if renderer_changed {
            return Change::Renderer;
        }
        if self.options.engine.shell != old.options.engine.shell {
            return Change::Shell;
        }
        Change::None
    }

    fn factory(
        &self,
        config: &Config,
        themes: &ThemeManager,
        syntax_set: &Arc<SyntaxSet>,
    ) -> Result<Arc<dyn RendererFactory>> {
        Ok(match self.backend {
            Backend::Markdown => Arc::new(MarkdownFactory::new(
                Arc::clone(syntax_set),
                themes.get(&self.theme),
            )),
            Backend::Auto | Backend::Asciidoctor => {
                Arc::new(AsciidoctorFactory::new(config.asciidoctor()?))
            }
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// `notes.adoc` becomes `notes.html`; an input already named `.html` gets a
/// second extension instead of being overwritten.
pub fn default_output_path(input: &Path) -> PathBuf {
    let candidate = input.with_extension("html");
    if candidate == input {
        let mut name = input.as_os_str().to_owned();
        name.push(".html");
        return PathBuf::from(name);
    }
    candidate
}

/// Writes through a sibling temp file and renames it into place, so a
/// browser reloading `path` never sees a half-written page.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .with_context(|| format!("Output path has no file name: {}", path.display()))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = dir.join(tmp_name);

    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}

fn read_document(path: &Path) -> Result<String> {
    let raw = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Renders `path` once, to `output` or stdout.
pub fn render_once(
    path: &Path,
    output: Option<&Path>,
    config: &Config,
    backend: Option<Backend>,
) -> Result<RenderedDocument> {
    let themes = ThemeManager::load(config)?;
    let syntax_set = Arc::new(SyntaxSet::load_defaults_newlines());
    let pipeline = Pipeline::resolve(path, config, &themes, backend);
    let factory = pipeline.factory(config, &themes, &syntax_set)?;
    let cache = Arc::new(BlockCache::new(pipeline.options.cache_capacity)?);
    let mut engine = RenderEngine::new(pipeline.options.engine.clone(), factory, cache)
        .context("Failed to start render workers")?;

    let text = read_document(path)?;
    let document = engine.render(&text);
    match output {
        Some(out) => write_atomic(out, &document.html)?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(document.html.as_bytes())?;
            stdout.flush()?;
        }
    }
    if document.is_partial() {
        tracing::warn!(
            target: "adocview::preview",
            fallbacks = document.stats.fallbacks,
            "some blocks could not be rendered"
        );
    }
    Ok(document)
}

enum PreviewMsg {
    Fs(notify::Result<notify::Event>),
    Render { generation: u64, event: RenderEvent },
}

/// Pending re-reads, each armed by a filesystem event.
#[derive(Debug, Default)]
struct FsReload {
    document: Option<Instant>,
    config: Option<Instant>,
}

impl FsReload {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.document, self.config) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn take_document(&mut self, now: Instant) -> bool {
        take_due(&mut self.document, now)
    }

    fn take_config(&mut self, now: Instant) -> bool {
        take_due(&mut self.config, now)
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    match *slot {
        Some(deadline) if deadline <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}

fn touches(event: &notify::Event, target: &Path) -> bool {
    event.paths.iter().any(|p| p == target)
}

/// Last-write-wins across scheduler restarts: a restart bumps the generation
/// and job ids start over.
#[derive(Debug, Default)]
struct ResultGate {
    generation: u64,
    latest: LatestResult,
}

impl ResultGate {
    fn restart(&mut self) -> u64 {
        self.generation += 1;
        self.latest = LatestResult::default();
        self.generation
    }

    fn accept(&mut self, generation: u64, job_id: JobId) -> bool {
        generation == self.generation && self.latest.accept(job_id)
    }
}

struct Preview {
    path: PathBuf,
    output: PathBuf,
    config_path: Option<PathBuf>,
    backend_override: Option<Backend>,
    config: Config,
    themes: ThemeManager,
    syntax_set: Arc<SyntaxSet>,
    pipeline: Pipeline,
    scheduler: RenderScheduler,
    gate: ResultGate,
    last_text: Option<String>,
    tx: mpsc::Sender<PreviewMsg>,
}

pub fn run_preview(
    path: PathBuf,
    output: Option<PathBuf>,
    config: Config,
    backend: Option<Backend>,
) -> Result<()> {
    let path = fs::canonicalize(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let output = output.unwrap_or_else(|| default_output_path(&path));
    let config_path = config::config_path().ok();

    let (tx, rx) = mpsc::channel();
    let fs_tx = tx.clone();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = fs_tx.send(PreviewMsg::Fs(res));
    })?;
    // Editors often replace the file instead of writing it, so watch the directory.
    let doc_dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
    watcher
        .watch(&doc_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", doc_dir.display()))?;
    if let Some(dir) = config_path.as_deref().and_then(Path::parent) {
        if dir.exists() && dir != doc_dir.as_path() {
            if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                tracing::warn!(
                    target: "adocview::preview",
                    error = %err,
                    "not watching config directory"
                );
            }
        }
    }

    let themes = ThemeManager::load(&config)?;
    let syntax_set = Arc::new(SyntaxSet::load_defaults_newlines());
    let pipeline = Pipeline::resolve(&path, &config, &themes, backend);
    let scheduler = start_scheduler(&pipeline, &config, &themes, &syntax_set, &tx, 0)?;

    tracing::info!(
        target: "adocview::preview",
        input = %path.display(),
        output = %output.display(),
        backend = ?pipeline.backend,
        "watching"
    );

    let mut preview = Preview {
        path,
        output,
        config_path,
        backend_override: backend,
        config,
        themes,
        syntax_set,
        pipeline,
        scheduler,
        gate: ResultGate::default(),
        last_text: None,
        tx,
    };
    preview.reload_document();

    let mut reload = FsReload::default();
    loop {
        let msg = match reload.next_deadline() {
            Some(deadline) => match rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            },
        };

        match msg {
            Some(PreviewMsg::Fs(Ok(event))) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                let deadline = Instant::now() + FS_SETTLE;
                if touches(&event, &preview.path) {
                    reload.document = Some(deadline);
                }
                if preview.config_path.as_deref().is_some_and(|p| touches(&event, p)) {
                    reload.config = Some(deadline);
                }
            }
            Some(PreviewMsg::Fs(Err(err))) => {
                tracing::warn!(target: "adocview::preview", error = %err, "watch error");
            }
            Some(PreviewMsg::Render { generation, event }) => {
                preview.on_render_event(generation, event)
            }
            None => {}
        }

        let now = Instant::now();
        if reload.take_config(now) {
            preview.reload_config();
        }
        if reload.take_document(now) {
            preview.reload_document();
        }
    }

    drop(watcher);
    Ok(())
}

fn start_scheduler(
    pipeline: &Pipeline,
    config: &Config,
    themes: &ThemeManager,
    syntax_set: &Arc<SyntaxSet>,
    tx: &mpsc::Sender<PreviewMsg>,
    generation: u64,
) -> Result<RenderScheduler> {
    let factory = pipeline.factory(config, themes, syntax_set)?;
    let tx = tx.clone();
    let sink = move |event| {
        let _ = tx.send(PreviewMsg::Render { generation, event });
    };
    RenderScheduler::spawn_with_probe(
        pipeline.options.clone(),
        factory,
        Box::new(CpuLoad::default()),
        Box::new(sink),
    )
    .context("Failed to start render scheduler")
}

impl Preview {
    fn reload_document(&mut self) {
        let text = match read_document(&self.path) {
            Ok(text) => text,
            Err(err) => {
                // Mid-save: the next event retries.
                tracing::debug!(target: "adocview::preview", error = %err, "document not readable");
                return;
            }
        };
        if self.last_text.as_deref() == Some(text.as_str()) {
            return;
        }
        self.scheduler.request_render(text.clone());
        self.last_text = Some(text);
    }

    fn reload_config(&mut self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        let config = match config::load_config_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    target: "adocview::preview",
                    error = %format_args!("{err:#}"),
                    "keeping previous config"
                );
                return;
            }
        };
        if let Err(err) = self.apply_config(config) {
            tracing::warn!(
                target: "adocview::preview",
                error = %format_args!("{err:#}"),
                "could not apply config"
            );
        }
    }

    fn apply_config(&mut self, config: Config) -> Result<()> {
        if config.theme_dir != self.config.theme_dir {
            self.themes = ThemeManager::load(&config)?;
        }
        let pipeline = Pipeline::resolve(&self.path, &config, &self.themes, self.backend_override);
        let change = pipeline.change_from(&self.pipeline);
        tracing::info!(target: "adocview::preview", ?change, "config reloaded");

        match change {
            Change::None => {}
            Change::Shell => self.scheduler.set_shell(pipeline.options.engine.shell.clone()),
            Change::Renderer => {
                let factory = pipeline.factory(&config, &self.themes, &self.syntax_set)?;
                self.scheduler.reconfigure(factory);
                self.scheduler.set_shell(pipeline.options.engine.shell.clone());
            }
            Change::Restart => {
                let scheduler = start_scheduler(
                    &pipeline,
                    &config,
                    &self.themes,
                    &self.syntax_set,
                    &self.tx,
                    self.gate.generation + 1,
                )?;
                self.scheduler = scheduler;
                self.gate.restart();
            }
        }
        self.pipeline = pipeline;
        self.config = config;

        if change != Change::None {
            if let Some(text) = self.last_text.clone() {
                self.scheduler.request_render(text);
            }
        }
        Ok(())
    }

    fn on_render_event(&mut self, generation: u64, event: RenderEvent) {
        if !self.gate.accept(generation, event.job_id()) {
            tracing::debug!(
                target: "adocview::preview",
                job = event.job_id(),
                "stale result dropped"
            );
            return;
        }
        match event {
            RenderEvent::Rendered(preview) => {
                if let Err(err) = write_atomic(&self.output, &preview.html) {
                    tracing::warn!(
                        target: "adocview::preview",
                        error = %format_args!("{err:#}"),
                        "write failed"
                    );
                    return;
                }
                let telemetry = self.scheduler.telemetry();
                tracing::info!(
                    target: "adocview::preview",
                    job = preview.job_id,
                    blocks = preview.stats.blocks,
                    rendered = preview.stats.rendered,
                    cached = preview.stats.cache_hits,
                    workers = preview.stats.workers,
                    partial = preview.is_partial(),
                    elapsed_ms = preview.duration.as_millis() as u64,
                    hit_rate = telemetry.cache.hit_rate(),
                    "wrote {}",
                    self.output.display()
                );
            }
            RenderEvent::Failed { job_id, error } => {
                tracing::warn!(
                    target: "adocview::preview",
                    job = job_id,
                    %error,
                    "render failed, keeping previous output"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Change, FsReload, Pipeline, ResultGate, default_output_path, render_once, take_due,
        write_atomic,
    };
    use crate::config::{Backend, Config};
    use crate::theme::ThemeManager;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn config() -> Config {
        Config {
            theme_dir: None,
            max_workers: 1,
            ..Config::default()
        }
    }

    #[test]
    fn results_from_old_jobs_and_old_schedulers_are_dropped() {
        let mut gate = ResultGate::default();
        assert!(gate.accept(0, 2));
        assert!(!gate.accept(0, 1));

        let next = gate.restart();
        assert_eq!(next, 1);
        // A late event from the replaced scheduler.
        assert!(!gate.accept(0, 3));
        // Job ids restart with the new scheduler.
        assert!(gate.accept(1, 1));
        assert!(!gate.accept(1, 1));
    }

    #[test]
    fn output_path_replaces_extension() {
        assert_eq!(default_output_path(Path::new("/d/notes.adoc")), Path::new("/d/notes.html"));
        assert_eq!(default_output_path(Path::new("README")), Path::new("README.html"));
        assert_eq!(default_output_path(Path::new("page.html")), Path::new("page.html.html"));
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.html");
        fs::write(&out, "old").unwrap();
        write_atomic(&out, "new").unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "new");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn fs_reload_fires_after_deadline() {
        let now = Instant::now();
        let mut reload = FsReload::default();
        assert_eq!(reload.next_deadline(), None);
        reload.document = Some(now + Duration::from_millis(100));
        reload.config = Some(now + Duration::from_millis(50));
        assert_eq!(reload.next_deadline(), Some(now + Duration::from_millis(50)));
        assert!(!reload.take_document(now));
        assert!(reload.take_config(now + Duration::from_millis(60)));
        assert!(reload.take_document(now + Duration::from_millis(100)));
        assert_eq!(reload.next_deadline(), None);

        let mut slot = None;
        assert!(!take_due(&mut slot, now));
    }

    #[test]
    fn config_changes_are_classified() {
        let themes = ThemeManager::load(&config()).unwrap();
        let md = Path::new("notes.md");
        let base = Pipeline::resolve(md, &config(), &themes, None);
        assert_eq!(base.backend, Backend::Markdown);
        assert_eq!(
            Pipeline::resolve(md, &config(), &themes, None).change_from(&base),
            Change::None
        );

        let themed = Config {
            theme: "InspiredGitHub".to_string(),
            ..config()
        };
        assert_eq!(
            Pipeline::resolve(md, &themed, &themes, None).change_from(&base),
            Change::Renderer
        );
        // AsciiDoc output carries no theme colours, only the page does.
        let adoc = Path::new("notes.adoc");
        let base_adoc = Pipeline::resolve(adoc, &config(), &themes, None);
        assert_eq!(
            Pipeline::resolve(adoc, &themed, &themes, None).change_from(&base_adoc),
            Change::Shell
        );

        let resized = Config {
            cache_capacity: 8,
            ..config()
        };
        assert_eq!(
            Pipeline::resolve(md, &resized, &themes, None).change_from(&base),
            Change::Restart
        );
        assert_eq!(
            Pipeline::resolve(md, &config(), &themes, Some(Backend::Asciidoctor))
                .change_from(&base),
            Change::Restart
        );
    }

    #[test]
    fn unknown_theme_resolves_to_fallback() {
        let cfg = Config {
            theme: "missing".to_string(),
            ..config()
        };
        let themes = ThemeManager::load(&cfg).unwrap();
        let pipeline = Pipeline::resolve(Path::new("a.md"), &cfg, &themes, None);
        assert_eq!(pipeline.theme, themes.fallback_name());
    }

    #[test]
    fn one_shot_markdown_render() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("doc.md");
        let text = "# Notes\n\nIntro *text*.\n\n## Code\n\n```rust\nfn main() {}\n```\n";
        fs::write(&input, text).unwrap();
        let out = dir.path().join("doc.html");

        let doc = render_once(&input, Some(&out), &config(), None).unwrap();
        let html = fs::read_to_string(&out).unwrap();
        assert_eq!(html, doc.html);
        assert_eq!(doc.title.as_deref(), Some("Notes"));
        assert_eq!(doc.fragments.len(), 2);
        assert!(html.contains("<em>text</em>"));
        assert!(!doc.is_partial());
    }
}
