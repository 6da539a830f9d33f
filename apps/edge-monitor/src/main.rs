use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use edge_cloud::CloudClient;
use edge_link::DeviceIdentity;
use edge_monitor::MonitorConfig;
use edge_monitor::logging::{self, LogConfig, LogLevel};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "edge-monitor", about = "Inspect cloud-registered edge devices")]
struct Cli {
    #[arg(long, help = "Cloud service base url (env: EDGE_CLOUD_URL)")]
    cloud_url: Option<String>,

    #[arg(long, help = "OAuth client id used for token exchange (env: EDGE_CLIENT_ID)")]
    client_id: Option<String>,

    #[arg(long, help = "Account access token (env: EDGE_ACCESS_TOKEN)")]
    token: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the account's devices as JSON.
    Devices,
    /// Exchange the account token for one scoped to a device.
    Token {
        #[arg(long)]
        product: String,
        #[arg(long)]
        device: String,
    },
    /// Poll the device list and print it whenever it changes.
    Watch {
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = MonitorConfig::from_env().with_overrides(cli.cloud_url, cli.client_id, cli.token);
    let Some(token) = config.access_token.clone() else {
        bail!("an access token is required (--token or EDGE_ACCESS_TOKEN)");
    };
    let client = CloudClient::new(&config.cloud_url, config.client_id.clone().unwrap_or_default())
        .with_context(|| format!("invalid cloud url {}", config.cloud_url))?;
    info!(target = "edge_monitor", cloud = %client.base_url(), "using cloud service");

    match cli.command {
        Command::Devices => {
            let devices = client.list_devices(&token).await?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Command::Token { product, device } => {
            if config.client_id.is_none() {
                bail!("token exchange needs a client id (--client-id or EDGE_CLIENT_ID)");
            }
            let identity = DeviceIdentity::new(product, device);
            let scoped = client.exchange_token(&token, &identity).await?;
            println!("{}", serde_json::to_string_pretty(&scoped)?);
        }
        Command::Watch { interval_secs } => {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            let mut last = None;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        let devices = client.list_devices(&token).await?;
                        if last.as_ref() != Some(&devices) {
                            println!("{}", serde_json::to_string_pretty(&devices)?);
                            last = Some(devices);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
