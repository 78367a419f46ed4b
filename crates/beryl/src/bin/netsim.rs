use std::net::SocketAddr;

use log::{Level, error, info};

use beryl::config;
use beryl_log::BerylLogger;
use beryl_transport::NetworkSimulator;

#[tokio::main]
async fn main() {
    BerylLogger::init(Level::Info).unwrap();

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let listen_addr = format!("{}:{}", config.network.host, config.simulator.listen_port);
    let target_addr: SocketAddr = match config.server_addr().parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid target address: {e}");
            std::process::exit(1);
        }
    };

    let simulator =
        match NetworkSimulator::bind(&listen_addr, target_addr, config.simulator.conditions())
            .await
        {
            Ok(simulator) => simulator,
            Err(e) => {
                error!("Failed to start network simulator on {listen_addr}: {e}");
                std::process::exit(1);
            }
        };

    let handle = simulator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            handle.shutdown();
        }
    });

    simulator.run().await;
}
