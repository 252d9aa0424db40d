mod config;
mod preview;
mod theme;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Backend;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "adocview", version, about = "Live HTML preview for AsciiDoc and Markdown")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Document to watch
    file: Option<PathBuf>,

    /// Where to write the page (default: FILE with an .html extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Renderer to use instead of the configured one
    #[arg(long, value_enum)]
    backend: Option<Backend>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a document once and exit
    Render {
        file: PathBuf,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },
    /// List available themes
    Themes,
    /// Open the config file in $EDITOR (default: nvim)
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adocview=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Commands::Config => return config::open_config_in_editor(),
            Commands::Themes => {
                let cfg = config::load_config()?;
                let manager = theme::ThemeManager::load(&cfg)?;
                for name in manager.theme_names() {
                    println!("{name}");
                }
                return Ok(());
            }
            Commands::Render { file, output, backend } => {
                let cfg = config::load_config()?;
                preview::render_once(&file, output.as_deref(), &cfg, backend)?;
                return Ok(());
            }
        }
    }

    let file = cli
        .file
        .ok_or_else(|| anyhow::anyhow!("No file provided. Try `adocview <file.adoc>`."))?;

    let cfg = config::load_config()?;
    preview::run_preview(file, cli.output, cfg, cli.backend)
}
