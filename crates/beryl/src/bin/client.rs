use log::{Level, error, info};

use beryl::config;
use beryl_log::BerylLogger;
use beryl_transport::ReliableClient;

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

    let mut client = ReliableClient::new(
        config.network.host.clone(),
        config.network.port,
        config.transport.window_size,
        config.transport.timeout_duration(),
    );

    if let Err(e) = client.connect().await {
        error!("Connection failed: {e}");
        std::process::exit(1);
    }

    match client.send_message(&config.transport.message).await {
        Ok(()) => info!(
            "Message delivered and acknowledged ({} segment retransmissions)",
            client.retransmissions()
        ),
        Err(e) => {
            error!("Failed to send message: {e}");
            client.close().await;
            std::process::exit(1);
        }
    }

    client.close().await;
}
