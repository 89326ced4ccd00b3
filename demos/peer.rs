use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use peerwire::address::format_endpoint;
use peerwire::config::TransportConfig;
use peerwire::manager::connection_manager::ConnectionManager;
use tokio::select;
use tracing::{info, Level};

/// A peer that sends a message to other peers and prints everything it receives
#[derive(Parser)]
struct Args {
    /// e.g. udp://0.0.0.0:7000
    udp_address: String,

    /// e.g. tcp://0.0.0.0:7000,track_incoming
    #[clap(long)]
    tcp_address: Option<String>,

    /// peer address to send the message to, e.g. udp://10.0.0.2:7000 or tcp://10.0.0.2:7000,block
    #[clap(long)]
    send_to: Vec<String>,

    #[clap(long, default_value = "hello")]
    message: String,

    #[clap(long, default_value_t = false)]
    best_effort: bool,

    /// reply to every received message with the same payload
    #[clap(long, default_value_t = false)]
    echo: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let manager = ConnectionManager::new(TransportConfig::default(), &args.udp_address, args.tcp_address.as_deref()).await?;
    info!("UDP on {:?}, TCP on {:?}", manager.local_udp_addr(), manager.local_tcp_addr());

    for to in &args.send_to {
        let accepted = manager.send(to, args.message.as_bytes(), !args.best_effort).await;
        info!("sending to {}: {}", to, if accepted { "ok" } else { "failed" });
    }

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(10)) => {
                while let Some(msg) = manager.receive() {
                    let from = format_endpoint(&msg.endpoint);
                    println!("{} ({} bytes): {}", from, msg.data.len(), String::from_utf8_lossy(&msg.data));
                    if args.echo {
                        manager.send(&from, &msg.data, msg.reliable).await;
                    }
                }
            }
        }
    }

    info!("statistics: {:?}", manager.stats());
    manager.shutdown().await;
    Ok(())
}
