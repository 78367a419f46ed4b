use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use beryl_wire::{Frame, Segmenter};

use crate::error::Result;
use crate::receiver::{ReceiverStore, SegmentDisposition};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// A reassembled message handed to the application consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub connection_id: u64,
    pub message_id: String,
    pub message: String,
}

/// Controls a running server from outside its accept loop.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    active: Arc<DashMap<u64, SocketAddr>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.active.len()
    }
}

/// Server side of the reliable transport: answers the max-size
/// handshake, stores and acknowledges segments per connection, and
/// delivers reassembled messages over the delivery channel.
pub struct ReliableServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_segment_size: usize,
    running: Arc<AtomicBool>,
    next_connection_id: AtomicU64,
    active: Arc<DashMap<u64, SocketAddr>>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
}

impl ReliableServer {
    /// Binds the listener and returns the server together with the
    /// receiving end of its delivery channel.
    pub async fn bind(
        addr: &str,
        max_segment_size: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Delivery>)> {
        // Fail fast on a segment size the wire layer cannot honor.
        Segmenter::new(max_segment_size)?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server initialized on {local_addr}, mode set to 'LISTEN'");

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                listener,
                local_addr,
                max_segment_size,
                running: Arc::new(AtomicBool::new(true)),
                next_connection_id: AtomicU64::new(0),
                active: Arc::new(DashMap::new()),
                delivery_tx,
            },
            delivery_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
            active: Arc::clone(&self.active),
        }
    }

    /// Accept loop: one worker task per connection, re-checking the
    /// shutdown flag at least once a second.
    pub async fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            match timeout(ACCEPT_TIMEOUT, self.listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    self.active.insert(connection_id, addr);
                    info!("New connection {connection_id} from {addr}");

                    let max_segment_size = self.max_segment_size;
                    let running = Arc::clone(&self.running);
                    let active = Arc::clone(&self.active);
                    let delivery_tx = self.delivery_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream,
                            connection_id,
                            max_segment_size,
                            running,
                            delivery_tx,
                        )
                        .await
                        {
                            error!("Connection {connection_id} error: {e}");
                        }
                        active.remove(&connection_id);
                        info!("Connection {connection_id} closed");
                    });
                }
                Ok(Err(e)) => error!("Error accepting connection: {e}"),
                Err(_) => continue,
            }
        }
        info!("Server shut down");
    }
}

async fn handle_connection(
    stream: TcpStream,
    connection_id: u64,
    max_segment_size: usize,
    running: Arc<AtomicBool>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let max_frame_bytes = max_segment_size + 1024;
    // The buffer survives read timeouts: a cancelled read_line may have
    // consumed a partial frame into it already.
    let mut line = String::new();

    // The first frame must be the handshake.
    loop {
        match timeout(ACCEPT_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => break,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                if !running.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
        }
    }
    match Frame::decode(line.as_bytes()) {
        Some(Frame::MaxSizeRequest) => {
            write_half
                .write_all(&Frame::MaxSizeReply { max_size: max_segment_size }.encode()?)
                .await?;
            info!("Sent max segment size {max_segment_size} to connection {connection_id}");
        }
        _ => {
            warn!("Invalid handshake on connection {connection_id}, closing");
            write_half
                .write_all(
                    &Frame::Error {
                        message: "Invalid request".to_owned(),
                    }
                    .encode()?,
                )
                .await?;
            return Ok(());
        }
    }

    let mut store = ReceiverStore::new();
    line.clear();
    loop {
        match timeout(ACCEPT_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => {
                info!("Client closed connection {connection_id}");
                return Ok(());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                if !running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                continue;
            }
        }
        let frame_line = std::mem::take(&mut line);

        if frame_line.len() > max_frame_bytes {
            warn!(
                "Oversized frame ({} bytes) dropped on connection {connection_id}",
                frame_line.len()
            );
            continue;
        }

        // Anything that fails to decode as a data segment is dropped;
        // the sender's retransmission recovers real losses.
        let Some(Frame::Data(segment)) = Frame::decode(frame_line.as_bytes()) else {
            debug!("Undecodable frame dropped on connection {connection_id}");
            continue;
        };

        let message_id = segment.message_id.clone();
        let seq = segment.sequence_number;

        match store.insert(segment) {
            SegmentDisposition::DuplicateCompleted { final_ack } => {
                warn!(
                    "Duplicate segment discarded - message {message_id}, sequence M{seq}"
                );
                write_half.write_all(&Frame::Ack(final_ack).encode()?).await?;
            }
            SegmentDisposition::DuplicateInFlight { highest } => {
                warn!(
                    "Duplicate segment discarded - message {message_id}, sequence M{seq}"
                );
                write_half.write_all(&Frame::Ack(highest).encode()?).await?;
            }
            SegmentDisposition::Stored { highest, complete } => {
                info!(
                    "Stored segment M{seq} of message {message_id} on connection {connection_id}, ACK M{highest}"
                );
                write_half.write_all(&Frame::Ack(highest).encode()?).await?;

                if complete {
                    let segments = store.take_complete(&message_id);
                    match Segmenter::reassemble_message(&segments) {
                        Some(message) => {
                            info!("Received complete message: {message}");
                            let _ = delivery_tx.send(Delivery {
                                connection_id,
                                message_id: message_id.clone(),
                                message,
                            });
                        }
                        None => error!("Failed to reassemble message {message_id}"),
                    }
                }
            }
        }
    }
}
