use clap::Parser;
use log::{error, info};
use server::admission::{LoginAdmission, OpenAuthenticator};
use server::config::ServerConfig;
use server::engine::{Engine, Inbound};
use server::network::UdpTransport;
use server::simulation::IdleWorld;
use shared::AccessLevel;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Command line arguments. Flags override values from the config file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Server IP address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Server port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// Tick rate (updates per second)
    #[clap(short, long)]
    tick_rate: Option<u32>,
    /// Players admitted before the admission queue kicks in
    #[clap(long)]
    max_players: Option<usize>,
    /// Usernames that log in with admin access (repeatable)
    #[clap(long = "admin")]
    admins: Vec<String>,
    /// Disable the stdin admin console
    #[clap(long)]
    no_console: bool,
}

fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if args.host.is_some() || args.port.is_some() {
        let (host, port) = match config.bind_address.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(8080)),
            None => ("127.0.0.1".to_string(), 8080),
        };
        config.bind_address = format!(
            "{}:{}",
            args.host.clone().unwrap_or(host),
            args.port.unwrap_or(port)
        );
    }
    if let Some(tick_rate) = args.tick_rate {
        config.tick.tick_rate = tick_rate;
    }
    if let Some(max_players) = args.max_players {
        config.admission.max_players = max_players;
    }
    config.validate()?;
    Ok(config)
}

/// Forwards stdin lines to the main loop and prints the replies.
fn spawn_console(triage: server::triage::InboundTriage) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            triage.console(line, Some(tx));
            match rx.await {
                Ok(reply) => println!("{}", reply),
                Err(_) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut authenticator = OpenAuthenticator::new();
    for admin in &args.admins {
        authenticator = authenticator.with_staff(admin, AccessLevel::Admin);
    }
    let admission = LoginAdmission::from_config(&config.admission, Box::new(authenticator))?;

    let inbound = Inbound::new(&config);
    let triage = inbound.triage();
    let transport = UdpTransport::bind(
        &config.bind_address,
        inbound.triage(),
        config.session.probe_interval(),
    )
    .await?;

    info!(
        "Accepting up to {} players at {} Hz (client version {})",
        config.admission.max_players, config.tick.tick_rate, config.admission.server_version
    );
    let mut engine = Engine::new(
        config,
        inbound,
        transport,
        Box::new(IdleWorld::default()),
        admission,
    );
    if let Some(path) = args.config.clone() {
        engine.set_config_path(path);
    }
    if !args.no_console {
        spawn_console(triage);
    }

    tokio::select! {
        _ = engine.run() => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    }

    engine.shutdown();
    // Let the sender task flush the kick notices
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
