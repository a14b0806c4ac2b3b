use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::game::GameState;
use server::network::Server;
use server::policy::{BanList, BanPolicy, NoBans};
use std::net::IpAddr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "27960")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Number of client slots
    #[arg(short = 'm', long, default_value = "32")]
    max_clients: usize,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Default per-client bandwidth in bytes per second
    #[arg(long, default_value = "25000")]
    rate: u32,

    /// Address to refuse, as ip or ip/prefix; may be repeated
    #[arg(long = "ban")]
    bans: Vec<String>,
}

fn parse_ban(entry: &str) -> Result<(IpAddr, u8), String> {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|e| format!("bad ban address '{}': {}", entry, e))?;
    let full = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p
            .parse()
            .map_err(|e| format!("bad ban prefix '{}': {}", entry, e))?,
        None => full,
    };
    Ok((addr, prefix))
}

async fn serve<P: BanPolicy>(config: ServerConfig, policy: P) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new(config, GameState::new(), policy).await?;
    server.run().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        max_clients: args.max_clients,
        timeout_msec: args.timeout * 1000,
        rate: args.rate,
        ..ServerConfig::default()
    }
    .with_tick_rate(args.tick_rate);

    info!("Starting server on {}", config.bind_addr);
    info!("Type 'help' for operator commands");

    if args.bans.is_empty() {
        return serve(config, NoBans).await;
    }

    let mut bans = BanList::default();
    for entry in &args.bans {
        let (addr, prefix) = parse_ban(entry)?;
        info!("Banning {}/{}", addr, prefix);
        bans.ban(addr, prefix);
    }
    serve(config, bans).await
}
