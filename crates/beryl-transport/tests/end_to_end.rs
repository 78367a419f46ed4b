use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use beryl_transport::{
    Delivery, NetworkConditions, NetworkSimulator, ReliableClient, ReliableServer, ServerHandle,
    SimulatorHandle,
};
use beryl_wire::Segmenter;

async fn start_server(
    max_segment_size: usize,
) -> (SocketAddr, UnboundedReceiver<Delivery>, ServerHandle) {
    let (server, delivered) = ReliableServer::bind("127.0.0.1:0", max_segment_size)
        .await
        .expect("server bind");
    let addr = server.local_addr();
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, delivered, handle)
}

async fn start_simulator(
    target: SocketAddr,
    conditions: NetworkConditions,
) -> (SocketAddr, SimulatorHandle) {
    let simulator = NetworkSimulator::bind("127.0.0.1:0", target, conditions)
        .await
        .expect("simulator bind");
    let addr = simulator.local_addr();
    let handle = simulator.handle();
    tokio::spawn(simulator.run());
    (addr, handle)
}

/// A segment size that leaves exactly `max_data` payload bytes per frame.
fn segment_size_for(max_data: usize) -> usize {
    let probe = Segmenter::new(4096).expect("probe segmenter");
    probe.metadata_overhead() + max_data
}

async fn expect_delivery(delivered: &mut UnboundedReceiver<Delivery>, secs: u64) -> Delivery {
    timeout(Duration::from_secs(secs), delivered.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

#[tokio::test]
async fn basic_single_segment_delivery() {
    let (addr, mut delivered, handle) = start_server(512).await;
    let mut client = ReliableClient::new("127.0.0.1", addr.port(), 4, Duration::from_secs(5));
    client.connect().await.expect("connect");
    assert_eq!(client.server_max_size(), Some(512));

    client.send_message("Hello, World!").await.expect("send");
    let delivery = expect_delivery(&mut delivered, 5).await;
    assert_eq!(delivery.message, "Hello, World!");
    assert_eq!(client.retransmissions(), 0);

    client.close().await;
    handle.shutdown();
}

#[tokio::test]
async fn multi_segment_utf8_delivery() {
    // Small payload budget to force several segments with multi-byte
    // characters near the boundaries.
    let (addr, mut delivered, handle) = start_server(segment_size_for(20)).await;
    let mut client = ReliableClient::new("127.0.0.1", addr.port(), 4, Duration::from_secs(5));
    client.connect().await.expect("connect");

    let message = "Hello, 世界! This is a test message with UTF-8 characters: 🌟🌍";
    client.send_message(message).await.expect("send");
    let delivery = expect_delivery(&mut delivered, 5).await;
    assert_eq!(delivery.message, message);

    client.close().await;
    handle.shutdown();
}

#[tokio::test]
async fn sequential_messages_on_one_connection() {
    let (addr, mut delivered, handle) = start_server(512).await;
    let mut client = ReliableClient::new("127.0.0.1", addr.port(), 4, Duration::from_secs(5));
    client.connect().await.expect("connect");

    client.send_message("first message").await.expect("send");
    client.send_message("second message").await.expect("send");

    let first = expect_delivery(&mut delivered, 5).await;
    let second = expect_delivery(&mut delivered, 5).await;
    assert_eq!(first.message, "first message");
    assert_eq!(second.message, "second message");
    assert_ne!(first.message_id, second.message_id);

    client.close().await;
    handle.shutdown();
}

#[tokio::test]
async fn lossy_link_recovers_by_retransmission() {
    let (server_addr, mut delivered, server_handle) = start_server(512).await;
    let conditions = NetworkConditions {
        packet_loss_rate: 0.2,
        ack_loss_rate: 0.05,
        min_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(60),
        seed: Some(42),
        ..NetworkConditions::default()
    };
    let (sim_addr, sim_handle) = start_simulator(server_addr, conditions).await;

    let mut client = ReliableClient::new("127.0.0.1", sim_addr.port(), 4, Duration::from_secs(2));
    client.connect().await.expect("connect through simulator");

    let message: String = ('a'..='z').cycle().take(2048).collect();
    client.send_message(&message).await.expect("send under loss");
    let delivery = expect_delivery(&mut delivered, 8).await;
    assert_eq!(delivery.message, message);

    client.close().await;
    sim_handle.shutdown();
    server_handle.shutdown();
}

#[tokio::test]
async fn fixed_delay_forces_retransmission() {
    // A 500 ms link delay against a 750 ms retransmission timeout: the
    // first ACK cannot arrive before the timer fires, so the callback
    // path must run, and the duplicate it produces must be suppressed.
    let (server_addr, mut delivered, server_handle) = start_server(512).await;
    let conditions = NetworkConditions {
        min_delay: Duration::from_millis(500),
        max_delay: Duration::from_millis(500),
        seed: Some(7),
        ..NetworkConditions::default()
    };
    let (sim_addr, sim_handle) = start_simulator(server_addr, conditions).await;

    let mut client =
        ReliableClient::new("127.0.0.1", sim_addr.port(), 4, Duration::from_millis(750));
    client.connect().await.expect("connect through simulator");

    client.send_message("delayed hello").await.expect("send");
    assert!(client.retransmissions() >= 1);

    let delivery = expect_delivery(&mut delivered, 5).await;
    assert_eq!(delivery.message, "delayed hello");
    assert!(
        timeout(Duration::from_millis(1500), delivered.recv())
            .await
            .is_err(),
        "retransmitted segments must not be delivered twice"
    );

    client.close().await;
    sim_handle.shutdown();
    server_handle.shutdown();
}

#[tokio::test]
async fn duplicated_frames_deliver_exactly_once() {
    let (server_addr, mut delivered, server_handle) = start_server(512).await;
    let conditions = NetworkConditions {
        duplication_rate: 0.5,
        max_delay: Duration::from_millis(20),
        seed: Some(1234),
        ..NetworkConditions::default()
    };
    let (sim_addr, sim_handle) = start_simulator(server_addr, conditions).await;

    let mut client = ReliableClient::new("127.0.0.1", sim_addr.port(), 4, Duration::from_secs(2));
    client.connect().await.expect("connect through simulator");

    let message: String = ('A'..='Z').cycle().take(1024).collect();
    client.send_message(&message).await.expect("send");

    let delivery = expect_delivery(&mut delivered, 8).await;
    assert_eq!(delivery.message, message);
    assert!(
        timeout(Duration::from_millis(800), delivered.recv())
            .await
            .is_err(),
        "duplicated frames must not trigger a second delivery"
    );

    client.close().await;
    sim_handle.shutdown();
    server_handle.shutdown();
}

#[tokio::test]
async fn reordering_delays_still_reassemble() {
    let (server_addr, mut delivered, server_handle) = start_server(segment_size_for(16)).await;
    let conditions = NetworkConditions {
        reordering_rate: 0.8,
        reordering_delay: Duration::from_millis(300),
        max_delay: Duration::from_millis(10),
        seed: Some(99),
        ..NetworkConditions::default()
    };
    let (sim_addr, sim_handle) = start_simulator(server_addr, conditions).await;

    let mut client = ReliableClient::new("127.0.0.1", sim_addr.port(), 4, Duration::from_secs(2));
    client.connect().await.expect("connect through simulator");

    // Four segments of sixteen bytes each.
    let message = "0123456789abcdef".repeat(4);
    client.send_message(&message).await.expect("send");
    let delivery = expect_delivery(&mut delivered, 8).await;
    assert_eq!(delivery.message, message);

    client.close().await;
    sim_handle.shutdown();
    server_handle.shutdown();
}

#[tokio::test]
async fn window_of_one_sends_ten_segments() {
    let (addr, mut delivered, handle) = start_server(segment_size_for(16)).await;
    let mut client = ReliableClient::new("127.0.0.1", addr.port(), 1, Duration::from_secs(5));
    client.connect().await.expect("connect");

    let message = "w".repeat(160);
    client.send_message(&message).await.expect("send");
    let delivery = expect_delivery(&mut delivered, 10).await;
    assert_eq!(delivery.message, message);
    // Nothing was lost, so the one-slot window alone paced the send.
    assert_eq!(client.retransmissions(), 0);

    client.close().await;
    handle.shutdown();
}

#[tokio::test]
async fn invalid_handshake_is_rejected() {
    let (addr, _delivered, handle) = start_server(512).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"HELLO THERE\n").await.expect("write");

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for reply")
        .expect("read");
    assert!(line.contains("ERROR"));
    assert!(line.contains("Invalid request"));

    handle.shutdown();
}
