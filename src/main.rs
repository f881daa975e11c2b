use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use farmnode::config::Config;
use farmnode::node::Node;

/// Build metadata baked into the binary at compile time.
mod build {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    pub fn commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// `--version` long form: release, commit and target triple.
    pub fn long_version() -> String {
        format!(
            "{VERSION} (commit {}, {}-{})",
            commit(),
            std::env::consts::ARCH,
            std::env::consts::OS,
        )
    }
}

/// Event-building and trigger pipeline worker for a DAQ farm.
#[derive(Parser)]
#[command(
    name = "farmnode",
    version = build::VERSION,
    long_version = build::long_version(),
    about
)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error). Defaults to
    /// the configured `log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)?;

    // The command line wins over the config file for verbosity.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    info!(
        version = build::VERSION,
        commit = build::commit(),
        config = %cli.config.display(),
        "starting farmnode",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        let mut node = Node::new(cfg)?;
        node.run_until_signal().await
    })?;

    info!("farmnode stopped");

    Ok(())
}
