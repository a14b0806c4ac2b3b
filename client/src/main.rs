use clap::Parser;
use client::network::Client;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:27960")]
    server: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Input frames sent per second
    #[arg(short = 't', long, default_value = "20")]
    tick_rate: u32,

    /// Reliable command to send after connecting; may be repeated
    #[arg(short = 'c', long = "command")]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let tick = Duration::from_millis(1000 / u64::from(args.tick_rate.max(1)));
    let mut client = Client::new(&args.server, tick, args.fake_ping).await?;
    for command in args.commands {
        client.queue_command(command);
    }

    client.run().await?;

    Ok(())
}
