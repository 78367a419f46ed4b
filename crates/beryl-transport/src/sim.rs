use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{sleep, timeout};

use beryl_wire::Frame;

use crate::error::Result;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
const DUPLICATE_EXTRA_DELAY: Duration = Duration::from_millis(50);

/// Failure model the simulator applies to relayed traffic. A plain
/// value handed to the constructor; nothing global.
#[derive(Debug, Clone)]
pub struct NetworkConditions {
    /// Probability of dropping a data frame.
    pub packet_loss_rate: f64,
    /// Probability of dropping an ACK frame.
    pub ack_loss_rate: f64,
    /// Base delay is sampled uniformly from this range.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Probability of duplicating a data frame (the copy gets +50 ms).
    pub duplication_rate: f64,
    /// Probability of adding `reordering_delay` to a data frame.
    pub reordering_rate: f64,
    pub reordering_delay: Duration,
    /// Fixed seed for reproducible fault patterns; `None` seeds from
    /// the OS.
    pub seed: Option<u64>,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            packet_loss_rate: 0.0,
            ack_loss_rate: 0.0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            duplication_rate: 0.0,
            reordering_rate: 0.0,
            reordering_delay: Duration::from_millis(500),
            seed: None,
        }
    }
}

struct QueuedFrame {
    destination: Arc<Mutex<OwnedWriteHalf>>,
    bytes: Bytes,
    delay: Duration,
    connection_id: u64,
}

/// Stops a running simulator.
#[derive(Clone)]
pub struct SimulatorHandle {
    running: Arc<AtomicBool>,
}

impl SimulatorHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Transparent TCP relay that injects loss, delay, duplication, and
/// reordering between a client and a server. Handshake frames bypass
/// the failure model so size negotiation always succeeds.
pub struct NetworkSimulator {
    listener: TcpListener,
    local_addr: SocketAddr,
    target_addr: SocketAddr,
    conditions: NetworkConditions,
    running: Arc<AtomicBool>,
    next_connection_id: AtomicU64,
    active: Arc<DashMap<u64, ()>>,
}

impl NetworkSimulator {
    pub async fn bind(
        addr: &str,
        target_addr: SocketAddr,
        conditions: NetworkConditions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Network simulator listening on {local_addr}, forwarding to {target_addr}");
        Ok(Self {
            listener,
            local_addr,
            target_addr,
            conditions,
            running: Arc::new(AtomicBool::new(true)),
            next_connection_id: AtomicU64::new(0),
            active: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Accept loop plus the single delivery worker that drains the
    /// shared queue, sleeps each frame's delay, and writes it out if
    /// the connection is still alive.
    pub async fn run(self) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_queued(queue_rx, Arc::clone(&self.active)));

        while self.running.load(Ordering::SeqCst) {
            match timeout(ACCEPT_TIMEOUT, self.listener.accept()).await {
                Ok(Ok((client, addr))) => {
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    info!("Simulator accepted connection {connection_id} from {addr}");
                    tokio::spawn(relay_connection(
                        client,
                        self.target_addr,
                        self.conditions.clone(),
                        connection_id,
                        Arc::clone(&self.active),
                        queue_tx.clone(),
                        Arc::clone(&self.running),
                    ));
                }
                Ok(Err(e)) => error!("Error accepting connection: {e}"),
                Err(_) => continue,
            }
        }
        info!("Network simulator shut down");
    }
}

async fn deliver_queued(
    mut queue_rx: mpsc::UnboundedReceiver<QueuedFrame>,
    active: Arc<DashMap<u64, ()>>,
) {
    while let Some(frame) = queue_rx.recv().await {
        if !active.contains_key(&frame.connection_id) {
            continue;
        }
        if !frame.delay.is_zero() {
            sleep(frame.delay).await;
        }
        // Re-check after the delay; the connection may be gone by now.
        if !active.contains_key(&frame.connection_id) {
            continue;
        }
        if let Err(e) = frame.destination.lock().await.write_all(&frame.bytes).await {
            debug!(
                "Delivery on connection {} failed: {e}",
                frame.connection_id
            );
            active.remove(&frame.connection_id);
        }
    }
}

async fn relay_connection(
    client: TcpStream,
    target_addr: SocketAddr,
    conditions: NetworkConditions,
    connection_id: u64,
    active: Arc<DashMap<u64, ()>>,
    queue_tx: mpsc::UnboundedSender<QueuedFrame>,
    running: Arc<AtomicBool>,
) {
    let server = match TcpStream::connect(target_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!("Simulator failed to reach target {target_addr}: {e}");
            return;
        }
    };
    active.insert(connection_id, ());

    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();
    let client_write = Arc::new(Mutex::new(client_write));
    let server_write = Arc::new(Mutex::new(server_write));

    let client_to_server = forward(
        client_read,
        Arc::clone(&server_write),
        conditions.clone(),
        connection_id,
        0,
        Arc::clone(&active),
        queue_tx.clone(),
        Arc::clone(&running),
    );
    let server_to_client = forward(
        server_read,
        Arc::clone(&client_write),
        conditions,
        connection_id,
        1,
        Arc::clone(&active),
        queue_tx,
        Arc::clone(&running),
    );

    // When either side closes, tear the whole relay down.
    tokio::select! {
        _ = client_to_server => {}
        _ = server_to_client => {}
    }
    active.remove(&connection_id);
    info!("Simulator connection {connection_id} closed");
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    read_half: OwnedReadHalf,
    destination: Arc<Mutex<OwnedWriteHalf>>,
    conditions: NetworkConditions,
    connection_id: u64,
    direction: u64,
    active: Arc<DashMap<u64, ()>>,
    queue_tx: mpsc::UnboundedSender<QueuedFrame>,
    running: Arc<AtomicBool>,
) {
    let mut rng: StdRng = match conditions.seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ connection_id.rotate_left(17) ^ (direction << 1)),
        None => StdRng::from_os_rng(),
    };
    let mut reader = BufReader::new(read_half);
    // The buffer survives read timeouts: a cancelled read_line may have
    // consumed a partial frame into it already.
    let mut line = String::new();

    loop {
        match timeout(ACCEPT_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let frame_line = std::mem::take(&mut line);
                let bytes = Bytes::from(frame_line.into_bytes());

                if Frame::is_handshake(&bytes) {
                    info!("Forwarding handshake frame directly");
                    if destination.lock().await.write_all(&bytes).await.is_err() {
                        break;
                    }
                    continue;
                }

                let is_ack = Frame::is_ack(&bytes);
                let drop_rate = if is_ack {
                    conditions.ack_loss_rate
                } else {
                    conditions.packet_loss_rate
                };
                if rng.random::<f64>() < drop_rate {
                    info!("Dropping {}", if is_ack { "ACK" } else { "data packet" });
                    continue;
                }

                let mut copies = vec![(bytes.clone(), Duration::ZERO)];
                if !is_ack && rng.random::<f64>() < conditions.duplication_rate {
                    info!("Duplicating packet");
                    copies.push((bytes, DUPLICATE_EXTRA_DELAY));
                }

                for (payload, extra_delay) in copies {
                    let mut delay = sample_delay(&mut rng, &conditions) + extra_delay;
                    if !is_ack && rng.random::<f64>() < conditions.reordering_rate {
                        info!("Reordering packet");
                        delay += conditions.reordering_delay;
                    }
                    let _ = queue_tx.send(QueuedFrame {
                        destination: Arc::clone(&destination),
                        bytes: payload,
                        delay,
                        connection_id,
                    });
                }
            }
            Ok(Err(e)) => {
                debug!("Forwarder read error on connection {connection_id}: {e}");
                break;
            }
            Err(_) => {
                if !running.load(Ordering::SeqCst) || !active.contains_key(&connection_id) {
                    break;
                }
            }
        }
    }
}

fn sample_delay(rng: &mut StdRng, conditions: &NetworkConditions) -> Duration {
    let min = conditions.min_delay.as_secs_f64();
    let max = conditions.max_delay.as_secs_f64();
    if max <= min {
        return conditions.min_delay;
    }
    Duration::from_secs_f64(rng.random_range(min..=max))
}
