//! `mailmirror` - mirror IMAP mailboxes into a local archive
//!
//! Runs one batch pass over every configured account, or stays connected
//! with `--live` and follows IDLE push events and local tag changes.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use mailmirror_core::{EngineConfig, ImapConnector, Notmuch, Settings, run_batch, run_live};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Settings file name inside the base directory.
const SETTINGS_FILE: &str = "mailmirror.json";

#[derive(Debug, Parser)]
#[command(name = "mailmirror", version, about)]
struct Cli {
    /// Settings file [default: <base>/mailmirror.json]
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory of mailbox index files [default: <base>/.index]
    #[arg(long, value_name = "DIR")]
    index: Option<PathBuf>,

    /// Archive directory [default: <base>/target]
    #[arg(long, value_name = "DIR")]
    target: Option<PathBuf>,

    /// Revision checkpoint file [default: <base>/.lastmod]
    #[arg(long, value_name = "FILE")]
    lastmod: Option<PathBuf>,

    /// Use the current directory as <base> instead of ~/mail
    #[arg(long)]
    portable: bool,

    /// Keep running and follow changes on both sides
    #[arg(long)]
    live: bool,

    /// Stop live mode after this many seconds
    #[arg(long, value_name = "SECS", requires = "live")]
    timeout: Option<u64>,
}

fn base_dir(portable: bool) -> anyhow::Result<PathBuf> {
    if portable {
        return std::env::current_dir().context("cannot determine the current directory");
    }
    match dirs::home_dir() {
        Some(home) => Ok(home.join("mail")),
        None => bail!("cannot determine the home directory; use --portable"),
    }
}

/// Flag, then settings file, then `<base>/<default>`.
fn resolve(flag: Option<PathBuf>, setting: Option<&Path>, base: &Path, default: &str) -> PathBuf {
    flag.or_else(|| setting.map(Path::to_path_buf))
        .unwrap_or_else(|| base.join(default))
}

async fn wait_for_stop(timeout: Option<Duration>) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = interrupt => info!("interrupted"),
        () = deadline => info!("timeout reached"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mailmirror=info,mailmirror_core=info,mailmirror_imap=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let base = base_dir(cli.portable)?;
    let settings_path = cli.config.unwrap_or_else(|| base.join(SETTINGS_FILE));
    let settings = Settings::load(&settings_path)
        .await
        .with_context(|| format!("cannot load settings from {}", settings_path.display()))?;

    let config = EngineConfig::new(
        resolve(cli.index, settings.index_dir.as_deref(), &base, ".index"),
        resolve(cli.target, settings.archive_dir.as_deref(), &base, "target"),
        resolve(cli.lastmod, settings.checkpoint_file.as_deref(), &base, ".lastmod"),
    )
    .with_settings(&settings);
    info!(
        index = %config.index_dir.display(),
        archive = %config.archive_dir.display(),
        accounts = settings.accounts.len(),
        "starting mailmirror"
    );

    let config = Arc::new(config);
    let store = Notmuch::new(&settings.notmuch);
    let connector = Arc::new(ImapConnector);

    if cli.live {
        let (stop, stopped) = watch::channel(false);
        let timeout = cli.timeout.map(Duration::from_secs);
        tokio::spawn(async move {
            wait_for_stop(timeout).await;
            let _ = stop.send(true);
        });
        run_live(config, store, connector, settings.accounts, stopped).await?;
        info!("stopped");
        return Ok(());
    }

    let report = run_batch(config, &store, connector, settings.accounts).await?;
    info!(
        mailboxes = report.mailboxes,
        tag_lines = report.tag_lines,
        deleted = report.confirmed_deletions,
        pushed = report.pushed,
        "done"
    );
    if report.failed_accounts > 0 || report.failed_mailboxes > 0 {
        error!(
            failed_accounts = report.failed_accounts,
            failed_mailboxes = report.failed_mailboxes,
            "some mailboxes were not mirrored"
        );
        bail!("incomplete run");
    }
    Ok(())
}
