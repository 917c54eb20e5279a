use std::process;
use std::time::Duration;

use relay::config::{GatewayConfig, LauncherKind, WorkerEndpoints};

const USAGE: &str = "\
Usage: relay-gateway [options]

Options:
  --host <host>               Listen host [default: 0.0.0.0]
  --port <port>               Listen port [default: 8080]
  --worker-base-port <port>   First worker UDP port, 0 for ephemeral [default: 8081]
  --launcher <kind>           process, task or pooled [default: process]
  --worker-bin <path>         relay-worker executable [default: next to this binary]
  --max-message <bytes>       Maximum sentence size [default: 100]
  --reply-timeout-ms <ms>     Per-step reply timeout [default: 5000]
  --no-chain                  Start every run from the last sentence set

Environment variables (RELAY_*) are applied first; flags override them.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay::logging::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config = GatewayConfig::from_env()?;
    let config = match parse_args(&args, config) {
        Ok(config) => config,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    tracing::info!(version = relay::RELAY_VERSION, "Starting relay gateway");

    let launcher = relay::build_launcher(&config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        relay::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    relay::serve(config, launcher, shutdown_rx).await?;
    Ok(())
}

fn parse_args(args: &[String], mut config: GatewayConfig) -> Result<GatewayConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || take_value(args, &mut i, flag);
        match flag {
            "--host" => config.host = value()?.to_string(),
            "--port" => config.port = number(flag, value()?)?,
            "--worker-base-port" => {
                let base: u16 = number(flag, value()?)?;
                let host = config.endpoints.addr(relay::TransformCode::Identity).ip();
                config.endpoints = WorkerEndpoints::from_base(host, base);
            }
            "--launcher" => config.launcher = value()?.parse::<LauncherKind>()?,
            "--worker-bin" => config.worker_program = value()?.into(),
            "--max-message" => {
                let size: usize = number(flag, value()?)?;
                if size == 0 {
                    return Err("--max-message must be positive".to_string());
                }
                config.max_message_size = size;
            }
            "--reply-timeout-ms" => {
                config.reply_timeout = Duration::from_millis(number(flag, value()?)?);
            }
            "--no-chain" => config.chain_results = false,
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unexpected argument: {other}")),
        }
        i += 1;
    }
    Ok(config)
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value '{value}' for {flag}"))
}
