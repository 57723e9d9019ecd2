use std::path::PathBuf;
use std::sync::Arc;

use treesync::config::SyncConfig;
use treesync::console::{Terminal, UserInterface};
use treesync::sync::session::SyncSession;
use treesync_core::HttpConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run { cached: bool },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    mode: CliMode,
    config: PathBuf,
    assume_yes: bool,
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs {
        mode: CliMode::Run { cached: false },
        config: PathBuf::from("sync-config.json"),
        assume_yes: false,
    };
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cached" => parsed.mode = CliMode::Run { cached: true },
            "--yes" | "-y" => parsed.assume_yes = true,
            "--config" => {
                let Some(path) = args.next() else {
                    anyhow::bail!("--config requires a path");
                };
                parsed.config = PathBuf::from(path);
            }
            "--help" | "-h" => parsed.mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = parse_cli_args(std::env::args())?;
    if args.mode == CliMode::Help {
        println!("Usage: treesync [--cached] [--yes] [--config <path>]");
        println!("  --cached        Reuse the remote tree saved by the last run");
        println!("  --yes, -y       Apply the plan without asking");
        println!("  --config PATH   Config file (default sync-config.json)");
        return Ok(());
    }

    let mut config = SyncConfig::load(&args.config)?;
    if args.assume_yes {
        config.confirm_actions = false;
    }
    let ui: Arc<dyn UserInterface> = Arc::new(Terminal);

    let cached = matches!(args.mode, CliMode::Run { cached: true });
    if cached {
        let answer = ui
            .confirm(
                "Cached mode assumes nothing changed the remote side since the last run. Continue? [Y/N]",
                &['Y', 'N'],
                Some('N'),
            )
            .await;
        if answer != 'Y' {
            eprintln!("[treesync] aborted");
            return Ok(());
        }
    }

    let mut session = SyncSession::new(HttpConnector, config, Arc::clone(&ui));
    let report = session.run(cached).await?;
    if report.failed.is_empty() {
        eprintln!("[treesync] synchronize complete");
    } else {
        eprintln!(
            "[treesync] synchronize finished with {} unresolved item(s)",
            report.failed.len()
        );
        for name in &report.failed {
            eprintln!("[treesync]   {name}");
        }
        std::process::exit(1);
    }
    Ok(())
}
