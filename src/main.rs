use std::path::Path;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use snippet_eval::output::ArtifactRef;
use snippet_eval::sandbox::worker::{self, WORKER_FLAG};
use snippet_eval::{Caller, Config, Delivery, EvalService, EvaluationRequest};

const DEFAULT_CONFIG_PATH: &str = "config/snippet-eval.toml";

/// Caller id of the local console operator.
const LOCAL_CALLER: &str = "local";

fn print_help() {
    println!(
        "\
snippet-eval v{}

Evaluates JavaScript snippets in a bounded sandbox.

USAGE:
    snippet-eval [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                   Built-in defaults are used when the default file is absent.

OPTIONS:
    -e, --eval CODE  Evaluate CODE and exit
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
        --worker     Evaluate one job read from stdin (process isolation)

Without --eval, each line read from stdin is evaluated as one snippet.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, snippet_eval=debug,warn)

EXAMPLES:
    snippet-eval -e '1 + 1'
    snippet-eval -e 'await webscrap(\"https://example.com\")'
    echo 'now()' | snippet-eval /etc/snippet-eval.toml
    RUST_LOG=debug snippet-eval -e '[1, 2, 3]'",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config_path: Option<String>,
    eval: Option<String>,
    worker: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config_path: None,
        eval: None,
        worker: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("snippet-eval v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--eval" | "-e" => {
                let code = iter.next().ok_or_else(|| anyhow!("{arg} expects a snippet"))?;
                args.eval = Some(code);
            }
            WORKER_FLAG => args.worker = true,
            _ if arg.starts_with('-') => return Err(anyhow!("Unknown option: {arg}")),
            _ => args.config_path = Some(arg),
        }
    }
    Ok(args)
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
        }
        None => {
            info!("No {DEFAULT_CONFIG_PATH}, using built-in defaults");
            Ok(Config::default())
        }
    }
}

/// Prints results on stdout. Artifacts are printed in full after a header.
struct StdoutDelivery;

#[async_trait]
impl Delivery for StdoutDelivery {
    async fn send_text(&self, text: &str) -> Result<()> {
        println!("{text}");
        Ok(())
    }

    async fn send_document(&self, artifact: &ArtifactRef) -> Result<()> {
        let content = tokio::fs::read_to_string(artifact.path()).await?;
        println!("── {} ({}) ──", artifact.filename(), artifact.human_size());
        println!("{content}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("snippet_eval=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // The job carries its own configuration
    if args.worker {
        return worker::serve().await;
    }

    let mut config = load_config(args.config_path.as_deref())?;
    if config.operators.allowed.is_empty() {
        warn!("No operators configured, only the local console may evaluate");
        config.operators.allowed.push(LOCAL_CALLER.to_string());
    }
    info!("Operators: {}", config.operators.allowed.join(", "));

    let service = EvalService::from_config(config);
    service.log_startup();
    let delivery = StdoutDelivery;

    if let Some(code) = args.eval {
        return run_one(&service, &delivery, code).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(code) => {
                        if let Err(e) = run_one(&service, &delivery, code).await {
                            error!("Delivery failed: {e:#}");
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
        }
    }
}

async fn run_one(service: &EvalService, delivery: &StdoutDelivery, code: String) -> Result<()> {
    let request = EvaluationRequest::new(code, Caller::new(LOCAL_CALLER), serde_json::json!({}));
    service.handle(&request, delivery).await?;
    Ok(())
}
