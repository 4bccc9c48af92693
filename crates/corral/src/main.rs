use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corralconf::CorralConfig;
use tracing_subscriber::EnvFilter;

use corral::bundle;
use corral::persist::SnapshotStore;

/// The corral capture pool daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a corral.toml, overriding discovery
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run the daemon (the default when no subcommand is given)
    Serve {
        /// Override the REST controller port
        #[arg(long)]
        rest_port: Option<u16>,

        /// Override the dashboard port
        #[arg(long)]
        dash_port: Option<u16>,

        /// Override the state directory
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Render the instance snapshot as a portable bundle
    Export {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the instance snapshot with the contents of a bundle file
    Import {
        /// Bundle file to read
        file: PathBuf,
    },

    /// Print the effective configuration and where it came from
    Config,
}

// The whole daemon runs on one thread; registry state only ever
// interleaves at await points.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("corral=info,corralconf=info,tower_http=info")
        }))
        .init();

    let action = cli.command.unwrap_or(Action::Serve {
        rest_port: None,
        dash_port: None,
        state_dir: None,
    });
    match action {
        Action::Serve {
            rest_port,
            dash_port,
            state_dir,
        } => {
            let mut config = CorralConfig::load_from(cli.config.as_deref())
                .context("Failed to load configuration")?;
            if let Some(port) = rest_port {
                config.rest.port = port;
            }
            if let Some(port) = dash_port {
                config.dashboard.port = port;
            }
            if let Some(dir) = state_dir {
                config.daemon.state_dir = dir;
            }
            corral::serve::run(config).await
        }
        Action::Export { output } => {
            let config = CorralConfig::load_from(cli.config.as_deref())
                .context("Failed to load configuration")?;
            export(&config, output.as_deref())
        }
        Action::Import { file } => {
            let config = CorralConfig::load_from(cli.config.as_deref())
                .context("Failed to load configuration")?;
            import(&config, &file)
        }
        Action::Config => show_config(cli.config.as_deref()),
    }
}

fn export(config: &CorralConfig, output: Option<&Path>) -> Result<()> {
    let (_store, configs) = SnapshotStore::open(config.state_file())?;
    let text = bundle::render(&configs);
    match output {
        Some(path) => {
            std::fs::write(path, &text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("exported {} instance(s) to {}", configs.len(), path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

// Offline import: rewrites the snapshot directly. Use the dashboard's
// bundle upload instead while the daemon is running, or this write will
// be clobbered by its next save.
fn import(config: &CorralConfig, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let configs = bundle::parse(&text)?;
    std::fs::create_dir_all(&config.daemon.state_dir)
        .context("Failed to create state directory")?;
    let (store, _existing) = SnapshotStore::open(config.state_file())?;
    let revision = store.save(&configs)?;
    eprintln!(
        "imported {} instance(s) (revision {revision})",
        configs.len()
    );
    Ok(())
}

fn show_config(path: Option<&Path>) -> Result<()> {
    let (config, sources) = CorralConfig::load_with_sources_from(path)?;
    print!("{}", config.to_toml());
    if !sources.files.is_empty() {
        eprintln!();
        for file in &sources.files {
            eprintln!("# loaded: {}", file.display());
        }
    }
    for var in &sources.env_overrides {
        eprintln!("# env: {var}");
    }
    Ok(())
}
