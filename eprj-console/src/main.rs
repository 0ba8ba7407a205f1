//! # Projector Console
//!
//! Interactive front end: pick a projector, then type commands and read
//! the raw responses.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

use eprj_client::{
    CancelToken, ClientConfig, ClientResult, ConnectionPool, ProjectorClient,
    TcpConnectionFactory, DIAGNOSTIC_COMMANDS,
};

#[derive(Debug, Parser)]
#[command(name = "eprj", about = "Send control commands to an Epson projector")]
struct Args {
    /// Projector address; prompted for when omitted.
    #[arg(short, long)]
    address: Option<String>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `eprj_client=debug`.
    #[arg(long, env = "EPRJ_LOG", default_value = "warn")]
    log: String,
}

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).context("invalid log filter")?)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let factory = Arc::new(TcpConnectionFactory::new(config.factory.clone()));
    let pool = ConnectionPool::new(factory, config.pool.clone());
    let _sweeper = pool.spawn_sweeper();

    let cancel = CancelToken::new();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let Some(client) = select_projector(&mut input, &pool, &config, args.address, &cancel).await?
    else {
        return Ok(());
    };

    while let Some(line) = prompt(&mut input, "Type Command or exit: ").await? {
        match line.trim() {
            "" => continue,
            "exit" => {
                println!("Exiting...");
                break;
            }
            "test" => run_diagnostics(&client, &cancel).await,
            "info" => match client.hardware_info(&cancel).await {
                Ok(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                Err(err) => println!("{}", err),
            },
            command => println!("{}", render(client.send_command(&cancel, command).await)),
        }
        println!();
    }

    pool.close_all().await;
    Ok(())
}

/// Prompts for addresses until one answers `power_status ?`.
async fn select_projector(
    input: &mut Input,
    pool: &ConnectionPool,
    config: &ClientConfig,
    mut preset: Option<String>,
    cancel: &CancelToken,
) -> anyhow::Result<Option<ProjectorClient>> {
    loop {
        let address = match preset.take() {
            Some(address) => address,
            None => match prompt(input, "Enter Address: ").await? {
                Some(address) => address.trim().to_string(),
                None => return Ok(None),
            },
        };

        let client = match ProjectorClient::new(address.as_str(), pool.clone()) {
            Ok(client) => client.with_command_timeout(config.command_timeout()),
            Err(err) => {
                println!("failed: {}\n", err);
                continue;
            }
        };

        match client.send_command(cancel, "power_status ?").await {
            Ok(status) => {
                println!("Connected to {} | Status: {}\n", address, status);
                return Ok(Some(client));
            }
            Err(err) => println!("failed: {}\n", err),
        }
    }
}

async fn run_diagnostics(client: &ProjectorClient, cancel: &CancelToken) {
    println!("Testing Commands:");
    for command in DIAGNOSTIC_COMMANDS {
        println!("{}", command);
        println!("{}", render(client.send_command(cancel, command).await));
        println!();
    }
}

async fn prompt(input: &mut Input, text: &str) -> anyhow::Result<Option<String>> {
    print!("{}", text);
    std::io::stdout().flush()?;
    Ok(input.next_line().await?)
}

fn render(result: ClientResult<String>) -> String {
    match result {
        Ok(response) => response,
        Err(err) => err.to_string(),
    }
}
