use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use relay::config::GatewayConfig;
use relay::transform::TransformCode;
use relay::worker::{WorkerConfig, run_worker};

const USAGE: &str = "\
Usage: relay-worker <kind> [options]

Arguments:
  <kind>                     identity, reverse, upper, lower, caesar, yours (or 1-6)

Options:
  --bind <addr>              UDP address [default: the kind's configured endpoint]
  --max-message <bytes>      Maximum datagram size [default: 100]
  --idle-timeout-ms <ms>     Exit if no request arrives in time, 0 waits forever
  --serve                    Keep serving instead of exiting after one request";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay::logging::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let defaults = GatewayConfig::from_env()?;
    let config = match parse_args(&args, &defaults) {
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

    run_worker(config).await?;
    Ok(())
}

fn parse_args(args: &[String], defaults: &GatewayConfig) -> Result<WorkerConfig, String> {
    let mut code: Option<TransformCode> = None;
    let mut bind: Option<SocketAddr> = None;
    let mut max_message_size = defaults.max_message_size;
    let mut idle_timeout = Some(defaults.worker_idle_timeout);
    let mut serve_forever = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                let value = args.get(i).ok_or("--bind requires a value")?;
                bind = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid address '{value}' for --bind"))?,
                );
            }
            "--max-message" => {
                i += 1;
                let value = args.get(i).ok_or("--max-message requires a value")?;
                max_message_size = value
                    .parse::<usize>()
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| format!("invalid value '{value}' for --max-message"))?;
            }
            "--idle-timeout-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--idle-timeout-ms requires a value")?;
                let ms: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid value '{value}' for --idle-timeout-ms"))?;
                idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            "--serve" => serve_forever = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if code.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                code = Some(arg.parse::<TransformCode>().map_err(|e| e.to_string())?);
            }
        }
        i += 1;
    }

    let code = code.ok_or("missing required argument: <kind>")?;
    let mut config = WorkerConfig::new(code, bind.unwrap_or(defaults.endpoints.addr(code)));
    config.max_message_size = max_message_size;
    config.idle_timeout = idle_timeout;
    config.serve_forever = serve_forever;
    Ok(config)
}
