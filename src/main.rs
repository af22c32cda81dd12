use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing::info;

use crs::cli::{Cli, CliCommand, PluginsCommand};
use crs::config::Config;
use crs::error::Result;
use crs::plugins::{PluginQueue, spawn_worker};
use crs::pr::PrKey;
use crs::rpc;
use crs::service::ReviewService;
use crs::store::Store;
use crs::upstream::GitHubHost;

fn init_logging() {
    // stdout carries RPC responses, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("crs starting");

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    info!(?config, "config loaded");

    if let Err(e) = run(cli, config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let store = Store::open(&config.db_path)?;
    let host = GitHubHost::new(&config.api_url, &config.token_env);
    let (queue, rx) = PluginQueue::channel();
    let service = Arc::new(ReviewService::new(&config, store, Arc::new(host), queue)?);

    match cli.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => {
            spawn_worker(service.runner().clone(), rx);
            info!(db = %config.db_path.display(), "serving requests on stdin");
            rpc::serve(
                service,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
        }
        CliCommand::Show {
            owner,
            repo,
            number,
            sync,
        } => {
            let key = PrKey::new(owner, repo, number);
            let view = tokio::task::spawn_blocking(move || service.get_pr(&key, sync))
                .await
                .map_err(|e| crs::error::Error::Process(format!("show task failed: {e}")))??;
            print!("{}", view.content);
            Ok(())
        }
        CliCommand::Plugins { action } => match action {
            PluginsCommand::List => {
                for plugin in service.list_plugins() {
                    println!("{}\t{} {}", plugin.name, plugin.command, plugin.args.join(" "));
                }
                Ok(())
            }
            PluginsCommand::Run {
                owner,
                repo,
                number,
            } => {
                let results = service.run_plugins(PrKey::new(owner, repo, number)).await?;
                for (name, output) in results {
                    println!("== {name} ({})", output.status.as_str());
                    println!("{}", output.result);
                }
                Ok(())
            }
        },
    }
}
