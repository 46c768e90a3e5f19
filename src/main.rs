use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use log::{LevelFilter, info};
use tokio::signal;

use pd_coordinator::config::{DEFAULT_INBOUND_CAPACITY, DEFAULT_LOG_INTERVAL_SECS};
use pd_coordinator::io_struct::DEFAULT_MAX_TOKENS;
use pd_coordinator::logging::init_logging;
use pd_coordinator::{
    EngineClient, GenerateOptions, PDConfig, PDCoordinator, Prompt, SamplingParams,
};

/// Run one request through a prefill tier and a decode tier.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// JSON config file; replaces the address and tuning flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoint the prefill tier pulls requests from (ipc://... or tcp://...)
    #[arg(long, required_unless_present = "config")]
    prefill_addr: Option<String>,

    /// Endpoint the decode tier pulls requests from
    #[arg(long, required_unless_present = "config")]
    decode_addr: Option<String>,

    /// Endpoint both tiers push responses to
    #[arg(long, required_unless_present = "config")]
    connector_addr: Option<String>,

    /// Served model name
    #[arg(long, required_unless_present = "config")]
    model: Option<String>,

    /// Seconds between in-flight request logs (0 disables)
    #[arg(long, default_value_t = DEFAULT_LOG_INTERVAL_SECS)]
    log_interval: u64,

    /// Per-response wait limit in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Text prompt to generate from
    #[arg(long)]
    prompt: String,

    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    max_tokens: u32,

    #[arg(long)]
    request_id: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

impl Args {
    fn pd_config(&self) -> Result<PDConfig> {
        if let Some(path) = &self.config {
            return PDConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()));
        }
        let (Some(prefill), Some(decode), Some(connector), Some(model)) = (
            &self.prefill_addr,
            &self.decode_addr,
            &self.connector_addr,
            &self.model,
        ) else {
            bail!("--prefill-addr, --decode-addr, --connector-addr and --model are required");
        };
        let config = PDConfig {
            log_interval: self.log_interval,
            request_timeout_ms: self.request_timeout_ms,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            ..PDConfig::new(prefill, decode, connector, model)
        };
        config.validate()?;
        Ok(config)
    }
}

async fn run_request(coordinator: &PDCoordinator, args: &Args) -> Result<()> {
    let request_id = args.request_id.clone().unwrap_or_else(|| {
        format!("cmpl-{}", chrono::Utc::now().timestamp_micros())
    });
    let mut stream = coordinator
        .generate(
            Prompt::Text(args.prompt.clone()),
            SamplingParams::with_max_tokens(args.max_tokens),
            request_id.clone(),
            GenerateOptions::default(),
        )
        .await?;
    while let Some(response) = stream.next().await {
        let response = response.with_context(|| format!("request {}", request_id))?;
        println!("{}", serde_json::to_string(&response)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    let config = args.pd_config()?;
    let coordinator = PDCoordinator::bind(config)
        .await
        .context("failed to bind P/D endpoints")?;

    let result = tokio::select! {
        res = run_request(&coordinator, &args) => res,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };
    coordinator.shutdown().await;
    result
}
