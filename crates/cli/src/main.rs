use clap::{Parser, Subcommand};
use herald::transport::TransportMode;

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Herald chat-bot gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway (health check, webhook endpoint, and Telegram intake).
    Gateway {
        /// Config file path (default: HERALD_CONFIG_PATH or ~/.herald/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,

        /// Intake mode: webhook or long-poll (default from config)
        #[arg(long, short, value_name = "MODE")]
        mode: Option<TransportMode>,
    },

    /// Load the configuration and print what the gateway would use.
    Check {
        /// Config file path (default: HERALD_CONFIG_PATH or ~/.herald/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("herald {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Gateway { config, port, mode }) => {
            if let Err(e) = run_gateway(config, port, mode).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    mode: Option<TransportMode>,
) -> anyhow::Result<()> {
    let (mut config, path) = herald::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if let Some(m) = mode {
        config.telegram.mode = m;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    herald::gateway::run_gateway(config).await
}

fn run_check(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = herald::config::load_config(config_path)?;
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("config:          {}", path.display());
    println!("listen:          {}:{}", config.gateway.bind, config.gateway.port);
    println!("mode:            {}", config.telegram.mode);
    println!(
        "bot token:       {}",
        yes_no(herald::config::resolve_telegram_token(&config).is_some())
    );
    println!(
        "webhook url:     {}",
        config.telegram.webhook_url.as_deref().unwrap_or("-")
    );
    println!("webhook path:    {}", config.telegram.webhook_path);
    println!(
        "redis limiter:   {}",
        yes_no(herald::config::resolve_redis_url(&config).is_some())
    );
    let mut commands: Vec<&str> = config.commands.keys().map(String::as_str).collect();
    commands.sort_unstable();
    println!("commands:        {}", commands.join(", "));
    Ok(())
}
