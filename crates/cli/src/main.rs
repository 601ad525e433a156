mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gen_core::llm::{GenOpts, TextGenerator as _};
use providers::kobold::{Dialect, KoboldClient, KoboldConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_CHANNEL: &str = "cli";

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate text on a KoboldAI or koboldcpp server", long_about = None)]
struct Args {
    /// Server base URL; overrides KOBOLD_ENDPOINT and the config file
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect the server dialect and print its version
    Probe {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a continuation for a prompt
    Generate {
        prompt: String,

        /// Stop sequence; repeat for more than one
        #[arg(short, long = "stop")]
        stop: Vec<String>,

        /// Channel the generation is registered under for Ctrl-C aborts
        #[arg(short, long, default_value = DEFAULT_CHANNEL)]
        channel: String,

        /// Wait on the calling thread instead of an async runtime
        #[arg(long)]
        blocking: bool,

        #[arg(long)]
        max_length: Option<u32>,

        #[arg(long)]
        temperature: Option<f64>,
    },
}

#[derive(Serialize)]
struct ProbeReport {
    endpoint: String,
    dialect: &'static str,
    version: f64,
}

fn dialect_name(d: Dialect) -> &'static str {
    match d {
        Dialect::Basic => "koboldai",
        Dialect::Extended => "koboldcpp",
    }
}

fn gen_opts(stop: Vec<String>, channel: String) -> GenOpts {
    GenOpts {
        stop: (!stop.is_empty()).then_some(stop),
        channel: Some(channel),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.log_file.as_deref())?;

    let mut cfg = KoboldConfig::from_env_and_file().context("load kobold config")?;
    if let Some(e) = args.endpoint {
        cfg.endpoint = e;
    }

    match args.command {
        Command::Probe { json } => {
            let client = KoboldClient::new(cfg).context("build http client")?;
            let version = client.check_version()?;
            let report = ProbeReport {
                endpoint: client.config().endpoint.clone(),
                dialect: dialect_name(client.dialect()),
                version,
            };
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("{} {} {}", report.endpoint, report.dialect, report.version);
            }
            Ok(())
        }
        Command::Generate {
            prompt,
            stop,
            channel,
            blocking,
            max_length,
            temperature,
        } => {
            if let Some(n) = max_length {
                cfg.generation.max_length = n;
            }
            if let Some(t) = temperature {
                cfg.generation.temperature = t;
            }
            for issue in cfg.generation.validate() {
                warn!(target: "cli", "generation setting out of range: {}", issue);
            }
            let client = KoboldClient::new(cfg).context("build http client")?;
            let opts = gen_opts(stop, channel);
            let text = if blocking {
                client.check_version()?;
                client.generate(&prompt, &opts)?
            } else {
                let rt = tokio::runtime::Runtime::new().context("start tokio runtime")?;
                rt.block_on(generate_or_abort(&client, &prompt, &opts))?
            };
            println!("{}", text);
            Ok(())
        }
    }
}

/// Runs one generation; Ctrl-C asks the server to abort it before exiting.
async fn generate_or_abort(client: &KoboldClient, prompt: &str, opts: &GenOpts) -> Result<String> {
    client.check_version_async().await?;
    tokio::select! {
        res = client.agenerate(prompt, opts) => Ok(res?),
        _ = tokio::signal::ctrl_c() => {
            if let Some(channel) = opts.channel() {
                info!(target: "cli", "interrupted, aborting channel={}", channel);
                // Failures are already logged by the client.
                let _ = client.abort(channel).await;
            }
            anyhow::bail!("interrupted")
        }
    }
}
