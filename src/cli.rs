use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use vilain::config::{Settings, DEFAULT_CONFIG_PATH};
use vilain::firewall::{BlockTable, MemoryTable, Pfctl};
use vilain::{logging, Vilain, VilainError};

#[derive(Parser)]
#[command(name = "vilain")]
#[command(author, version, about = "Vilain mimic fail2ban with pf for OpenBSD")]
pub struct Cli {
    /// Location of the config file
    #[arg(short = 'c', long = "conf", default_value = DEFAULT_CONFIG_PATH)]
    pub conf: PathBuf,

    /// Run in debug mode (also logs to stdout)
    #[arg(short, long)]
    pub debug: bool,

    /// Keep bans in memory instead of calling pfctl
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    if !cli.dry_run && !vilain::is_root() {
        return Err(VilainError::Privilege.into());
    }

    let settings = Settings::load(&cli.conf)?;
    let _guard = logging::init(&settings.log_file, cli.debug)?;
    info!("Read config file: {}", cli.conf.display());

    let block: Arc<dyn BlockTable> = if cli.dry_run {
        info!("Dry run, bans are kept in memory");
        Arc::new(MemoryTable::new())
    } else {
        Arc::new(Pfctl::new(settings.pfctl.clone()))
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    Vilain::new(settings, block).run(cancel).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_conf() {
        let cli = Cli::parse_from(["vilain"]);
        assert_eq!(cli.conf, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!cli.debug);
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["vilain", "-c", "/tmp/v.toml", "-d", "--dry-run"]);
        assert_eq!(cli.conf, PathBuf::from("/tmp/v.toml"));
        assert!(cli.debug);
        assert!(cli.dry_run);
    }
}
