// Therm suite: operator console for the device link, tool listener and trial sequence.

use std::path::PathBuf;

use anyhow::{bail, Context};
use therm_suite::{config, OperatorCommand, SuiteSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = "commands: connect | participant <n> | play | auto on|off | \
test <temperature> <duration> [location|direction] | status | quit";

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("therm-suite {}", VERSION);
                return Ok(());
            }
            "--config" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(config_path.as_deref()).context("loading config")?;
    let kind = cfg.illusion;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let session = SuiteSession::start(cfg, notice_tx).await?;
        println!("tool listener on {}; {}", session.tool_addr(), HELP);

        tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                println!("{notice}");
            }
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match OperatorCommand::parse(&line, kind) {
                    Ok(cmd) => {
                        let quit = cmd == OperatorCommand::Quit;
                        if cmd_tx.send(cmd).is_err() || quit {
                            break;
                        }
                    }
                    Err(e) => println!("{e}; {HELP}"),
                }
            }
        });

        tokio::select! {
            res = session.run(cmd_rx) => res,
            res = shutdown_signal() => res,
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown requested");
    Ok(())
}
