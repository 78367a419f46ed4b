use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep, timeout};

use beryl_wire::{Frame, Segmenter};

use crate::error::{Result, TransportError};
use crate::window::{SlidingWindow, WindowSegment};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_RETRIES: u32 = 3;
const MAX_ACK_RETRIES: u32 = 5;
const RESEND_BACKOFF_START: Duration = Duration::from_millis(500);

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;
type SharedSegmenter = Arc<std::sync::Mutex<Segmenter>>;

/// Client side of the reliable transport: negotiates the segment size,
/// splits messages, drives the sliding window, and processes ACKs.
///
/// One message is in flight at a time; every `send_message` call starts
/// a fresh window with its base at zero.
pub struct ReliableClient {
    host: String,
    port: u16,
    window_size: u64,
    timeout: Duration,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<SharedWriter>,
    segmenter: Option<SharedSegmenter>,
    window: Option<SlidingWindow>,
    server_max_size: Option<usize>,
    retransmissions: Arc<AtomicU64>,
}

impl ReliableClient {
    pub fn new(host: impl Into<String>, port: u16, window_size: u64, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            window_size,
            timeout,
            reader: None,
            writer: None,
            segmenter: None,
            window: None,
            server_max_size: None,
            retransmissions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn server_max_size(&self) -> Option<usize> {
        self.server_max_size
    }

    /// Number of segments re-sent by the retransmission path so far.
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.load(Ordering::Relaxed)
    }

    /// Opens the connection and performs the max-size handshake, then
    /// builds the segmenter and the initial sliding window.
    pub async fn connect(&mut self) -> Result<()> {
        let stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| TransportError::Io(std::io::ErrorKind::TimedOut.into()))??;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));

        info!("Sending max size request to server");
        writer
            .lock()
            .await
            .write_all(&Frame::MaxSizeRequest.encode()?)
            .await?;

        let mut max_size = None;
        // The line buffer survives timeouts: a cancelled read_line may
        // already have consumed part of a frame into it.
        let mut line = String::new();
        for attempt in 1..=HANDSHAKE_RETRIES {
            match timeout(self.timeout, reader.read_line(&mut line)).await {
                Ok(Ok(0)) => return Err(TransportError::ConnectionClosed),
                Ok(Ok(_)) => match Frame::decode(line.as_bytes()) {
                    Some(Frame::MaxSizeReply { max_size: size }) => {
                        max_size = Some(size);
                        break;
                    }
                    Some(Frame::Error { message }) => {
                        return Err(TransportError::HandshakeRejected(message));
                    }
                    _ => {
                        return Err(TransportError::HandshakeRejected(
                            "unexpected handshake reply".to_owned(),
                        ));
                    }
                },
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!("Timeout waiting for max size reply (attempt {attempt}/{HANDSHAKE_RETRIES})");
                }
            }
        }
        let max_size = max_size.ok_or(TransportError::HandshakeTimeout(HANDSHAKE_RETRIES))?;

        self.segmenter = Some(Arc::new(std::sync::Mutex::new(Segmenter::new(max_size)?)));
        self.server_max_size = Some(max_size);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.window = Some(self.new_window()?);
        info!(
            "Connected to {}:{}, server max segment size {}",
            self.host, self.port, max_size
        );
        Ok(())
    }

    /// Builds a window wired to the retransmission path: the window's
    /// callback hands expired batches to a resend task over a channel,
    /// which re-serializes and re-writes them with exponential back-off.
    fn new_window(&self) -> Result<SlidingWindow> {
        let writer = self.writer.clone().ok_or(TransportError::NotConnected)?;
        let segmenter = self.segmenter.clone().ok_or(TransportError::NotConnected)?;

        let window = SlidingWindow::new(self.window_size, self.timeout);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        window.set_retransmission_callback(Arc::new(move |batch: Vec<WindowSegment>| {
            let _ = batch_tx.send(batch);
        }));
        self.spawn_resend_task(writer, segmenter, batch_rx);
        Ok(window)
    }

    fn spawn_resend_task(
        &self,
        writer: SharedWriter,
        segmenter: SharedSegmenter,
        mut batch_rx: mpsc::UnboundedReceiver<Vec<WindowSegment>>,
    ) {
        let send_timeout = self.timeout;
        let retransmissions = Arc::clone(&self.retransmissions);
        tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let mut backoff = RESEND_BACKOFF_START;
                for (i, window_segment) in batch.iter().enumerate() {
                    if i > 0 {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(send_timeout);
                    }
                    let frame = segmenter
                        .lock()
                        .unwrap()
                        .serialize_segment(&window_segment.original_segment);
                    match frame {
                        Ok(frame) => {
                            if let Err(e) = writer.lock().await.write_all(&frame).await {
                                error!(
                                    "Error retransmitting segment M{}: {e}",
                                    window_segment.sequence_number
                                );
                                break;
                            }
                            retransmissions.fetch_add(1, Ordering::Relaxed);
                            info!("Retransmitted segment M{}", window_segment.sequence_number);
                        }
                        Err(e) => error!(
                            "Error serializing segment M{}: {e}",
                            window_segment.sequence_number
                        ),
                    }
                }
            }
        });
    }

    /// Sends one message: segments it, pumps the window while reading
    /// ACKs with short deadlines, and fails after five consecutive ACK
    /// timeouts or once the overall `3 x timeout` deadline passes.
    pub async fn send_message(&mut self, message: &str) -> Result<()> {
        let window = self.new_window()?;
        if let Some(previous) = self.window.replace(window.clone()) {
            previous.cleanup();
        }
        let writer = self.writer.clone().ok_or(TransportError::NotConnected)?;
        let segmenter = self.segmenter.clone().ok_or(TransportError::NotConnected)?;

        let mut pending: VecDeque<_> = segmenter
            .lock()
            .unwrap()
            .segment_message(message)?
            .into();
        let deadline = Instant::now() + self.timeout * 3;
        let mut retries = 0u32;

        let reader = self.reader.as_mut().ok_or(TransportError::NotConnected)?;

        // Kept across read timeouts: a cancelled read_line may have
        // consumed a partial frame into it already.
        let mut line = String::new();
        let result = 'send: loop {
            if Instant::now() >= deadline {
                break Err(TransportError::DeadlineExceeded);
            }

            // Fill the window.
            while window.can_send() {
                let Some(segment) = pending.pop_front() else {
                    break;
                };
                let frame = segmenter.lock().unwrap().serialize_segment(&segment);
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => break 'send Err(e.into()),
                };
                let seq = window.add_segment(segment);
                if let Err(e) = writer.lock().await.write_all(&frame).await {
                    break 'send Err(e.into());
                }
                if let Some(seq) = seq {
                    info!("Sent segment M{seq}");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let ack_timeout = Duration::from_millis(500).min(remaining / 2);
            if ack_timeout.is_zero() {
                break Err(TransportError::DeadlineExceeded);
            }

            match timeout(ack_timeout, reader.read_line(&mut line)).await {
                Ok(Ok(0)) => break Err(TransportError::ConnectionClosed),
                Ok(Ok(_)) => {
                    let frame = Frame::decode(line.as_bytes());
                    line.clear();
                    match frame {
                        Some(Frame::Ack(ack)) => {
                            window.handle_ack(ack);
                            retries = 0;
                            if pending.is_empty() && window.is_empty() {
                                break Ok(());
                            }
                        }
                        _ => warn!("Received malformed ACK"),
                    }
                }
                Ok(Err(e)) => break Err(e.into()),
                Err(_) => {
                    retries += 1;
                    if retries > MAX_ACK_RETRIES {
                        break Err(TransportError::AckTimeout(retries));
                    }
                    warn!("Timeout waiting for ACK (retry {retries}/{MAX_ACK_RETRIES})");
                    let backoff = Duration::from_millis((100u64 << retries).min(1000));
                    sleep(backoff).await;
                }
            }
        };

        if result.is_err() {
            window.cleanup();
        }
        result
    }

    /// Shuts the connection down and drops all per-connection state.
    pub async fn close(&mut self) {
        if let Some(window) = self.window.take() {
            window.cleanup();
        }
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.lock().await.shutdown().await {
                warn!("Error during socket shutdown: {e}");
            }
        }
        self.reader = None;
        self.segmenter = None;
        self.server_max_size = None;
    }
}
