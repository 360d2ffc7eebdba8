//! Network fan-out (§6.3): chunks are serialized, LZ4-compressed, and
//! framed with a big-endian `u32` length prefix over TCP. A board can act
//! as a server (fan a stream out to any number of connecting clients) or
//! as a client (pull a stream from a remote board), matching the
//! `NetworkRole` the composite-manager side already models.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use streamboard_foundation::chunk::Chunk;
use streamboard_foundation::error::{BoardError, ResourceError, TransientError};
use streamboard_telemetry::BoardMetrics;

/// Hard cap on a single frame's decompressed size, guarding against a
/// corrupt or hostile length prefix forcing an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

async fn write_frame(stream: &mut TcpStream, chunk: &Chunk) -> Result<(), ResourceError> {
    let encoded = bincode::serialize(chunk)
        .map_err(|e| ResourceError::FileUnwritable(format!("failed to encode chunk: {e}")))?;
    let compressed = lz4_flex::compress_prepend_size(&encoded);

    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, compressed.len() as u32);
    stream.write_all(&len_buf).await?;
    stream.write_all(&compressed).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Chunk>, ResourceError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ResourceError::Io(e)),
    }
    let len = BigEndian::read_u32(&len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ResourceError::SocketClosed(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_BYTES}"
        )));
    }

    let mut compressed = vec![0u8; len as usize];
    stream.read_exact(&mut compressed).await?;
    let encoded = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| ResourceError::SocketClosed(format!("corrupt frame: {e}")))?;
    let chunk = bincode::deserialize(&encoded)
        .map_err(|e| ResourceError::SocketClosed(format!("corrupt chunk: {e}")))?;
    Ok(Some(chunk))
}

/// Accepts connections on `addr` and fans every chunk sent on `chunks` out
/// to all currently-connected clients. A client that falls behind past its
/// bounded mailbox is dropped rather than allowed to stall the others.
pub struct NetworkServer {
    listener: TcpListener,
    metrics: Option<BoardMetrics>,
}

impl NetworkServer {
    pub async fn bind(addr: &str) -> Result<Self, ResourceError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: BoardMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs forever: accepts clients in the background, forwards every
    /// chunk received on `chunks` to each connected client's own mailbox.
    pub async fn run(self, mut chunks: mpsc::Receiver<Chunk>) -> Result<(), BoardError> {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<mpsc::Sender<Chunk>>();
        let metrics = self.metrics.clone();

        let listener = self.listener;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, peer)) => {
                        tracing::info!(%peer, "network client connected");
                        let (tx, mut rx) = mpsc::channel::<Chunk>(32);
                        if client_tx.send(tx).is_err() {
                            return;
                        }
                        tokio::spawn(async move {
                            while let Some(chunk) = rx.recv().await {
                                if write_frame(&mut stream, &chunk).await.is_err() {
                                    tracing::warn!(%peer, "network client write failed, dropping");
                                    break;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept network client");
                    }
                }
            }
        });

        // Per-client send buffer full (§5 back-pressure rule (b)): the
        // overflowed chunk is dropped and that client's next send is
        // demoted to `Discontinuous` rather than silently resuming as if
        // nothing had been missed.
        struct Client {
            tx: mpsc::Sender<Chunk>,
            pending_demote: bool,
        }

        let mut clients: Vec<Client> = Vec::new();
        loop {
            tokio::select! {
                new_client = client_rx.recv() => {
                    match new_client {
                        Some(tx) => clients.push(Client { tx, pending_demote: false }),
                        None => return Ok(()),
                    }
                }
                chunk = chunks.recv() => {
                    let Some(chunk) = chunk else { return Ok(()) };
                    clients.retain_mut(|client| {
                        let outgoing = if client.pending_demote {
                            Chunk { continuity: streamboard_foundation::continuity::Continuity::Discontinuous, ..chunk.clone() }
                        } else {
                            chunk.clone()
                        };
                        match client.tx.try_send(outgoing) {
                            Ok(()) => {
                                client.pending_demote = false;
                                true
                            }
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                if let Some(m) = &metrics {
                                    m.record_error("network client overflow, dropping and demoting next send".to_string());
                                    m.network_overflow_drops.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                }
                                client.pending_demote = true;
                                true
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => false,
                        }
                    });
                }
            }
        }
    }
}

/// Starting reconnect delay, multiplicative growth factor, and cap for the
/// exponential backoff a [`NetworkClient`] applies between connect attempts
/// (§5: "start 25 ms, factor 1.3, cap 15 s").
const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(25);
const RECONNECT_BACKOFF_FACTOR: f64 = 1.3;
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Connects to a remote [`NetworkServer`] and republishes every chunk it
/// sends onto `out`, reconnecting with an exponential backoff on disconnect.
pub struct NetworkClient {
    addr: String,
    backoff_start: Duration,
    backoff_factor: f64,
    backoff_cap: Duration,
    metrics: Option<BoardMetrics>,
}

impl NetworkClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            backoff_start: RECONNECT_BACKOFF_START,
            backoff_factor: RECONNECT_BACKOFF_FACTOR,
            backoff_cap: RECONNECT_BACKOFF_CAP,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BoardMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Overrides the default backoff schedule (start, growth factor, cap),
    /// mainly so tests don't have to wait 15 real seconds.
    pub fn with_reconnect_backoff(mut self, start: Duration, factor: f64, cap: Duration) -> Self {
        self.backoff_start = start;
        self.backoff_factor = factor;
        self.backoff_cap = cap;
        self
    }

    /// Runs until `out` is dropped by the receiver. On any read/connect
    /// failure, waits the current backoff delay (growing geometrically up
    /// to the cap, reset to `backoff_start` after a successful connect) and
    /// tries again.
    pub async fn run(self, out: mpsc::Sender<Chunk>) -> Result<(), BoardError> {
        let mut backoff = self.backoff_start;
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(mut stream) => {
                    tracing::info!(addr = %self.addr, "connected to network server");
                    backoff = self.backoff_start;
                    loop {
                        match read_frame(&mut stream).await {
                            Ok(Some(chunk)) => {
                                if out.send(chunk).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(None) => {
                                tracing::warn!(addr = %self.addr, "server closed connection");
                                break;
                            }
                            Err(e) => {
                                if let Some(m) = &self.metrics {
                                    m.record_error(e.to_string());
                                }
                                tracing::warn!(addr = %self.addr, error = %e, "network read failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.record_error(TransientError::SocketBufferFull(e.to_string()).to_string());
                        m.network_reconnects.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    tracing::warn!(addr = %self.addr, error = %e, backoff_ms = backoff.as_millis() as u64, "failed to connect, retrying");
                }
            }
            tokio::time::sleep(backoff).await;
            let next_ms = (backoff.as_secs_f64() * self.backoff_factor * 1000.0) as u64;
            backoff = Duration::from_millis(next_ms).min(self.backoff_cap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamboard_foundation::alignment::ChunkAlignment;
    use streamboard_foundation::chunk::ChunkPayload;
    use streamboard_foundation::continuity::Continuity;
    use std::collections::{BTreeMap, BTreeSet};

    fn test_chunk(number: u64) -> Chunk {
        Chunk {
            payload: ChunkPayload::Series1(vec![1.0, 2.0, 3.0]),
            start_time: 0.0,
            fs: 16_000.0,
            number,
            continuity: Continuity::WithPrevious,
            alignment: ChunkAlignment::new(0, 0, 0, 0, 16_000.0),
            processor_name: "net_test".into(),
            sources: BTreeSet::new(),
            identifier: None,
            data_generation_time: BTreeMap::new(),
            metadata: BTreeMap::new(),
            initial_sample_time: None,
        }
    }

    #[tokio::test]
    async fn frame_round_trips_over_a_real_tcp_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, &test_chunk(7)).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        server.await.unwrap();
        let received = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(received.number, 7);
        if let ChunkPayload::Series1(v) = received.payload {
            assert_eq!(v, vec![1.0, 2.0, 3.0]);
        } else {
            panic!("expected Series1 payload");
        }
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let result = read_frame(&mut client).await.unwrap();
        assert!(result.is_none());
    }
}
