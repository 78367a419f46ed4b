use log::{Level, error, info};

use beryl::config;
use beryl_log::BerylLogger;
use beryl_transport::ReliableServer;

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

    let addr = config.server_addr();
    let (server, mut delivered) =
        match ReliableServer::bind(&addr, config.transport.maximum_msg_size).await {
            Ok(bound) => bound,
            Err(e) => {
                error!("Failed to start server on {addr}: {e}");
                std::process::exit(1);
            }
        };

    // The application consumer: log every reassembled message.
    tokio::spawn(async move {
        while let Some(delivery) = delivered.recv().await {
            info!(
                "Application received message {} on connection {}: {}",
                delivery.message_id, delivery.connection_id, delivery.message
            );
        }
    });

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            handle.shutdown();
        }
    });

    server.run().await;
}
