use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use runkit_protocol::API_KEY_ENV_VAR;
use runkit_protocol::BASE_URL_ENV_VAR;
use runkit_protocol::RunMode;
use runkit_worker::WorkerOptions;

const DEFAULT_BASE_URL: &str = "https://api.runkit.dev";
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;

/// Background process that persists and uploads run data for a host program.
#[derive(Debug, Parser)]
#[command(name = "runkit-worker", version)]
struct Cli {
    #[arg(long, value_name = "MODE")]
    mode: RunMode,

    #[arg(long = "log-file", value_name = "FILE")]
    log_file: PathBuf,

    #[arg(long = "data-file", value_name = "FILE")]
    data_file: PathBuf,

    #[arg(long = "base-url", value_name = "URL", env = BASE_URL_ENV_VAR, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long = "api-key", env = API_KEY_ENV_VAR, hide_env_values = true, hide = true)]
    api_key: Option<String>,

    /// How long to wait for in-flight uploads once the host is done.
    #[arg(long = "drain-timeout-ms", value_name = "MS", default_value_t = DEFAULT_DRAIN_TIMEOUT_MS)]
    drain_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = runkit_worker::init_logging(&cli.log_file)?;

    let mut opts = WorkerOptions::new(cli.mode, cli.data_file, cli.base_url);
    opts.api_key = cli.api_key;
    opts.drain_timeout = Duration::from_millis(cli.drain_timeout_ms);
    runkit_worker::run_main(opts, tokio::io::stdin(), tokio::io::stdout()).await
}
