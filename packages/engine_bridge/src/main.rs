use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::prelude::*;

use engine_bridge::config::{DEFAULT_CONFIG_FILE, FileConfig, load_config};
use engine_bridge::{BridgeRegistry, EngineChannel, MethodCall, MethodResponse};
use engine_session::EngineFamily;

/// How often interactive mode drains engine output
const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "engine-bridge")]
#[command(about = "Drive a chess engine process through its method channel")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Engine family: challenger, eleeye or pikafish
    #[arg(short, long, default_value = "eleeye")]
    family: EngineFamily,

    /// Engine executable (overrides the config file)
    #[arg(short, long)]
    binary: Option<String>,

    /// Read JSON method calls from stdin, write JSON responses to stdout
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries engine output and responses
    let default_directive = if args.debug {
        "engine_bridge=debug,engine_session=debug,info"
    } else {
        "engine_bridge=info,engine_session=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config: FileConfig = load_config(&args.config)
        .extract()
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(binary) = args.binary {
        config.engines.get_mut(args.family).binary = Some(binary);
    }

    let registry = BridgeRegistry::attach(&config);
    let channel = registry
        .channel(args.family)
        .cloned()
        .with_context(|| format!("No channel for engine family {}", args.family))?;
    info!(
        "Using channel {} ({})",
        channel.name(),
        config.engine_config(args.family).program
    );

    if args.json {
        run_json(&channel).await?;
    } else {
        run_interactive(&channel).await?;
    }

    drop(channel);
    registry.detach_all().await;
    Ok(())
}

/// One JSON `MethodCall` per input line, one JSON `MethodResponse` per output line
async fn run_json(channel: &EngineChannel) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<MethodCall>(&line) {
            Ok(call) => channel.invoke(call).await,
            Err(e) => MethodResponse::error("bad_request", e.to_string()),
        };
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// Plain lines are engine commands; `:method [argument]` lines call the channel
async fn run_interactive(channel: &EngineChannel) -> Result<()> {
    let startup = channel.invoke(MethodCall::bare("startup")).await;
    println!("startup -> {}", describe(&startup));

    let poller = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(READ_POLL_INTERVAL);
            loop {
                interval.tick().await;
                while let MethodResponse::Success {
                    result: Value::String(line),
                } = channel.invoke(MethodCall::bare("read")).await
                {
                    println!("{}", line);
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let call = match parse_directive(&line) {
            Some(call) => call,
            None if line.trim().is_empty() => continue,
            None => MethodCall::new("send", Value::String(line)),
        };
        let echo = call.method != "send";
        let method = call.method.clone();
        let response = channel.invoke(call).await;
        if echo || response.status() != Some(0) {
            println!("{} -> {}", method, describe(&response));
        }
    }

    let shutdown = channel.invoke(MethodCall::bare("shutdown")).await;
    poller.abort();
    while let MethodResponse::Success {
        result: Value::String(line),
    } = channel.invoke(MethodCall::bare("read")).await
    {
        println!("{}", line);
    }
    println!("shutdown -> {}", describe(&shutdown));
    Ok(())
}

/// Parse `:method [argument]`. Integer arguments become JSON numbers, except
/// for `send`, whose argument is always an engine command line.
fn parse_directive(line: &str) -> Option<MethodCall> {
    let rest = line.trim().strip_prefix(':')?;
    let (method, argument) = match rest.split_once(char::is_whitespace) {
        Some((method, argument)) => (method, argument.trim()),
        None => (rest, ""),
    };
    if method.is_empty() {
        return None;
    }
    let arguments = if argument.is_empty() {
        Value::Null
    } else if method == "send" {
        Value::String(argument.to_string())
    } else if let Ok(n) = argument.parse::<i64>() {
        Value::from(n)
    } else {
        Value::String(argument.to_string())
    };
    Some(MethodCall::new(method, arguments))
}

fn describe(response: &MethodResponse) -> String {
    match response {
        MethodResponse::Success { result } => result.to_string(),
        MethodResponse::NotImplemented => "not implemented".to_string(),
        MethodResponse::Error { code, message } => format!("error {}: {}", code, message),
    }
}
