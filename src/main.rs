use clap::{Parser, Subcommand};
use ovpn_manager::helper::Helper;
use ovpn_manager::manager::config_name;
use ovpn_manager::poller::PollStatus;
use ovpn_manager::{
    Config, ConnectionRequest, ConnectionState, Credentials, ManagerEvent, VpnManager,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "ovpn-manager")]
#[command(about = "Start, supervise and stop OpenVPN sessions through a privileged helper")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./ovpn-manager.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect with an OpenVPN config and stay attached until Ctrl-C
    Connect {
        /// OpenVPN configuration file
        config_file: PathBuf,

        /// Username for VPN authentication (prompts for the password)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Ask the helper whether a configuration is connected
    Status {
        /// OpenVPN configuration file or its name
        target: String,
    },
    /// Ask the helper to stop a configuration
    Stop {
        /// OpenVPN configuration file or its name
        target: String,
    },
    /// Generate default config file
    Init,
}

fn load_config(path: Option<&Path>) -> Result<Config, ovpn_manager::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => Config::discover(),
    }
}

fn prompt_credentials(user: Option<String>) -> std::io::Result<Credentials> {
    let Some(username) = user else {
        return Ok(Credentials::default());
    };
    eprint!("Password for {}: ", username);
    std::io::stderr().flush()?;
    let password = rpassword::read_password()?;
    Ok(Credentials::new(username, password))
}

fn print_event(event: &ManagerEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to encode event: {}", e),
        }
        return;
    }

    match event {
        ManagerEvent::StateChanged(state) => println!("[{}]", state),
        ManagerEvent::Log(line) => println!("{}", line),
        ManagerEvent::Failed(failure) => eprintln!("Error: {}", failure),
        ManagerEvent::SessionEnded => println!("Session ended"),
    }
}

/// Prints events until the session ends
async fn print_events(mut events: broadcast::Receiver<ManagerEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) => {
                print_event(&event, json);
                if event == ManagerEvent::SessionEnded {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_connect(
    config: Config,
    config_file: PathBuf,
    user: Option<String>,
    json: bool,
) -> Result<ConnectionState, Box<dyn std::error::Error>> {
    let credentials = prompt_credentials(user)?;
    let request = ConnectionRequest::new(config_file, credentials)?;
    let manager = VpnManager::new(config)?;

    let mut printer = tokio::spawn(print_events(manager.subscribe(), json));
    let connector = manager.clone();
    let connect = tokio::spawn(async move { connector.connect(request).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, disconnecting...");
            manager.disconnect().await;
            let _ = (&mut printer).await;
        }
        _ = &mut printer => {}
    }

    match connect.await {
        Ok(Err(e)) => info!("Connect finished: {}", e),
        Err(e) => error!("Connect task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(manager.state())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for events
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Connect { config_file, user } => {
            let config = load_config(cli.config.as_deref())?;
            let state = run_connect(config, config_file, user, cli.json).await?;
            if matches!(state, ConnectionState::AuthFailed | ConnectionState::Error) {
                std::process::exit(1);
            }
        }
        Commands::Status { target } => {
            let config = load_config(cli.config.as_deref())?;
            let name = config_name(Path::new(&target));
            let output = Helper::from_config(&config).status(&name).await?;
            let status = PollStatus::parse(&output);
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "config": name, "status": status.as_str() })
                );
            } else {
                println!("{}: {}", name, status.as_str());
            }
        }
        Commands::Stop { target } => {
            let config = load_config(cli.config.as_deref())?;
            let name = config_name(Path::new(&target));
            info!("Stopping {}...", name);
            Helper::from_config(&config)
                .stop(&name, &config.connection.log_path)
                .await?;
            println!("Stopped {}", name);
        }
        Commands::Init => {
            info!("Generating default config...");
            let config = Config::default();
            let path = cli
                .config
                .unwrap_or_else(|| PathBuf::from("ovpn-manager.toml"));
            config.save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}
