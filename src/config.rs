use adocview::block::{Dialect, Splitter};
use adocview::debounce::DebounceConfig;
use adocview::engine::EngineOptions;
use adocview::html::DocumentShell;
use adocview::render::asciidoctor::AsciidoctorCommand;
use adocview::render::pool::default_worker_count;
use adocview::scheduler::SchedulerOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pick from the file extension
    Auto,
    Asciidoctor,
    Markdown,
}

impl Backend {
    /// Resolves `Auto` from the file extension.
    pub fn resolve(self, path: &Path) -> Backend {
        match self {
            Backend::Auto => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase());
                match ext.as_deref() {
                    Some("md" | "markdown" | "mdown") => Backend::Markdown,
                    _ => Backend::Asciidoctor,
                }
            }
            other => other,
        }
    }

    pub fn dialect(self) -> Dialect {
        match self {
            Backend::Markdown => Dialect::Markdown,
            Backend::Auto | Backend::Asciidoctor => Dialect::Asciidoc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub theme: String,
    pub theme_dir: Option<PathBuf>,
    pub backend: Backend,
    pub asciidoctor_command: String,
    pub cache_capacity: usize,
    pub max_workers: usize,
    pub parallel_threshold: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub split_level: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            theme: "base16-ocean.dark".to_string(),
            theme_dir: dirs::config_dir().map(|dir| dir.join("bat").join("themes")),
            backend: Backend::Auto,
            asciidoctor_command: "asciidoctor".to_string(),
            cache_capacity: adocview::cache::DEFAULT_CAPACITY,
            max_workers: adocview::render::pool::MAX_WORKERS,
            parallel_threshold: adocview::render::parallel::DEFAULT_PARALLEL_THRESHOLD,
            min_delay_ms: 20,
            max_delay_ms: 600,
            split_level: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PartialConfig {
    theme: Option<String>,
    theme_dir: Option<PathBuf>,
    backend: Option<Backend>,
    asciidoctor_command: Option<String>,
    cache_capacity: Option<usize>,
    max_workers: Option<usize>,
    parallel_threshold: Option<usize>,
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    split_level: Option<u8>,
}

fn or_default<T>(value: Option<T>, default: T, changed: &mut bool) -> T {
    match value {
        Some(v) => v,
        None => {
            *changed = true;
            default
        }
    }
}

impl PartialConfig {
    fn apply_defaults(self) -> (Config, bool) {
        let d = Config::default();
        let mut changed = false;
        let c = &mut changed;

        let theme_dir = match self.theme_dir {
            Some(v) => Some(v),
            None => {
                *c = true;
                d.theme_dir
            }
        };

        let cfg = Config {
            theme: or_default(self.theme, d.theme, c),
            theme_dir,
            backend: or_default(self.backend, d.backend, c),
            asciidoctor_command: or_default(self.asciidoctor_command, d.asciidoctor_command, c),
            cache_capacity: or_default(self.cache_capacity, d.cache_capacity, c),
            max_workers: or_default(self.max_workers, d.max_workers, c),
            parallel_threshold: or_default(self.parallel_threshold, d.parallel_threshold, c),
            min_delay_ms: or_default(self.min_delay_ms, d.min_delay_ms, c),
            max_delay_ms: or_default(self.max_delay_ms, d.max_delay_ms, c),
            split_level: or_default(self.split_level, d.split_level, c),
        };
        (cfg, changed)
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            anyhow::bail!("cache_capacity must be at least 1");
        }
        if self.min_delay_ms > self.max_delay_ms {
            anyhow::bail!(
                "min_delay_ms ({}) is larger than max_delay_ms ({})",
                self.min_delay_ms,
                self.max_delay_ms
            );
        }
        self.asciidoctor()?;
        Ok(())
    }

    pub fn asciidoctor(&self) -> Result<AsciidoctorCommand> {
        AsciidoctorCommand::parse(&self.asciidoctor_command)
            .with_context(|| format!("Invalid asciidoctor_command: {}", self.asciidoctor_command))
    }

    pub fn scheduler_options(&self, dialect: Dialect, shell: DocumentShell) -> SchedulerOptions {
        SchedulerOptions {
            cache_capacity: self.cache_capacity,
            engine: EngineOptions {
                splitter: Splitter::new(dialect, self.split_level),
                shell,
                workers: default_worker_count(self.max_workers),
                parallel_threshold: self.parallel_threshold,
            },
            debounce: DebounceConfig::with_bounds(
                Duration::from_millis(self.min_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join("adocview").join("config.toml"))
}

pub fn ensure_config_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        write_config_to(path, &cfg)?;
        return Ok(cfg);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let partial: PartialConfig =
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
    let (cfg, changed) = partial.apply_defaults();
    if changed {
        write_config_to(path, &cfg)?;
    }
    cfg.validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(cfg)
}

pub fn write_config(cfg: &Config) -> Result<()> {
    write_config_to(&config_path()?, cfg)
}

pub fn write_config_to(path: &Path, cfg: &Config) -> Result<()> {
    ensure_config_dir(path)?;
    let text = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn open_config_in_editor() -> Result<()> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = Config::default();
        write_config(&cfg)?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "nvim".to_string());
    let mut parts = match shell_words::split(&editor) {
        Ok(p) if !p.is_empty() => p,
        _ => vec![editor],
    };
    let cmd = parts.remove(0);
    let status = Command::new(cmd)
        .args(parts)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor for {}", path.display()))?;
    if !status.success() {
        anyhow::bail!("Editor exited with status {}", status);
    }
    Ok(())
}
