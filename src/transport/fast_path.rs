//! Fast path session over a multiplexed connection
//!
//! Outbound media: every chunk gets a fresh unidirectional stream holding
//! the kind tag and one envelope; the write side is finished right after.
//! Ordering across streams is best-effort.
//!
//! Inbound: one task accepts streams and hands each to its own reader, a
//! second task reads control datagrams. Both stop on the session's
//! cancellation token.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{
    MuxConnection, MuxConnector, SessionEventKind, SessionEventSender, TransportSession,
    TransportStrategy, UniRecvStream,
};
use crate::error::{AppError, Result};
use crate::media::MediaPipeline;
use crate::protocol::{decode_stream_payload, encode_stream_payload, ControlSignal, EncodedChunk, MediaKind};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// What the inbound loops need
struct Inbound {
    pipeline: Arc<MediaPipeline>,
    events: SessionEventSender,
    max_chunk_bytes: usize,
    throttler: LogThrottler,
}

/// Fast path session with one remote participant
pub struct FastPathSession {
    participant: String,
    connection: Arc<dyn MuxConnection>,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    throttler: LogThrottler,
}

impl FastPathSession {
    /// Connect to `endpoint` and start the inbound loops
    ///
    /// Handshake failure or timeout yields `Establishment`.
    pub async fn open(
        connector: &dyn MuxConnector,
        endpoint: &str,
        connect_timeout: Duration,
        pipeline: Arc<MediaPipeline>,
        events: SessionEventSender,
        max_chunk_bytes: usize,
    ) -> Result<Arc<Self>> {
        debug!("Opening fast path to {} for {}", endpoint, events.participant());
        let connection = match tokio::time::timeout(connect_timeout, connector.connect(endpoint)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(AppError::Establishment(format!("{}: {}", endpoint, e)));
            }
            Err(_) => {
                return Err(AppError::Establishment(format!(
                    "{}: handshake timed out after {:?}",
                    endpoint, connect_timeout
                )));
            }
        };
        Ok(Self::start(connection, pipeline, events, max_chunk_bytes))
    }

    /// Wrap an established connection and start the inbound loops
    pub fn start(
        connection: Arc<dyn MuxConnection>,
        pipeline: Arc<MediaPipeline>,
        events: SessionEventSender,
        max_chunk_bytes: usize,
    ) -> Arc<Self> {
        let participant = events.participant().to_string();
        let cancel = CancellationToken::new();
        let inbound = Arc::new(Inbound {
            pipeline,
            events,
            max_chunk_bytes,
            throttler: LogThrottler::with_secs(5),
        });

        let streams = tokio::spawn(stream_loop(connection.clone(), inbound.clone(), cancel.clone()));
        let datagrams = tokio::spawn(datagram_loop(connection.clone(), inbound, cancel.clone()));

        info!("Fast path session started for {}", participant);
        Arc::new(Self {
            participant,
            connection,
            cancel,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![streams, datagrams]),
            throttler: LogThrottler::with_secs(5),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn write_stream(&self, payload: &[u8]) -> Result<()> {
        let mut stream = self.connection.open_uni().await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl TransportSession for FastPathSession {
    fn kind(&self) -> TransportStrategy {
        TransportStrategy::FastPath
    }

    fn participant(&self) -> &str {
        &self.participant
    }

    async fn send_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::InvalidState(format!("fast path to {} is closed", self.participant)));
        }
        let payload = encode_stream_payload(chunk, kind)?;
        let result = self.write_stream(&payload).await;
        match &result {
            Ok(()) => {
                trace!("Sent {} chunk ts={} to {}", kind, chunk.timestamp_micros, self.participant);
                self.throttler.clear("send_chunk");
            }
            Err(e) => {
                warn_throttled!(
                    self.throttler,
                    "send_chunk",
                    "Failed to send {} chunk to {}: {}",
                    kind,
                    self.participant,
                    e
                );
            }
        }
        result
    }

    async fn send_control(&self, signal: ControlSignal) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::InvalidState(format!("fast path to {} is closed", self.participant)));
        }
        self.connection
            .send_datagram(Bytes::copy_from_slice(&signal.to_bytes()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.connection.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Fast path session closed for {}", self.participant);
    }
}

async fn stream_loop(connection: Arc<dyn MuxConnection>, inbound: Arc<Inbound>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = connection.accept_uni() => next,
        };

        match next {
            Ok(Some(stream)) => {
                let inbound = inbound.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = read_chunk(stream, &inbound) => {}
                    }
                });
            }
            Ok(None) => {
                if !cancel.is_cancelled() {
                    inbound.events.emit(SessionEventKind::Disconnected {
                        reason: "connection closed by remote".to_string(),
                    });
                }
                break;
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    inbound
                        .events
                        .emit(SessionEventKind::Failed(AppError::StreamRead(e.to_string())));
                }
                break;
            }
        }
    }
    debug!("Stream loop for {} stopped", inbound.events.participant());
}

async fn read_chunk(stream: UniRecvStream, inbound: &Inbound) {
    let participant = inbound.events.participant();
    let mut data = Vec::new();
    let limit = inbound.max_chunk_bytes as u64 + 1;
    if let Err(e) = stream.take(limit).read_to_end(&mut data).await {
        inbound
            .events
            .emit(SessionEventKind::Failed(AppError::StreamRead(e.to_string())));
        return;
    }

    if data.len() > inbound.max_chunk_bytes {
        warn_throttled!(
            inbound.throttler,
            "oversized",
            "Discarding stream from {} larger than {} bytes",
            participant,
            inbound.max_chunk_bytes
        );
        return;
    }

    match decode_stream_payload(&data) {
        Ok((kind, chunk)) => {
            if let Err(e) = inbound.pipeline.decode_remote(participant, kind, chunk).await {
                debug!("Decode of {} chunk from {} failed: {}", kind, participant, e);
            }
        }
        Err(e) => {
            warn_throttled!(inbound.throttler, "malformed", "Discarding chunk from {}: {}", participant, e);
        }
    }
}

async fn datagram_loop(connection: Arc<dyn MuxConnection>, inbound: Arc<Inbound>, cancel: CancellationToken) {
    let participant = inbound.events.participant().to_string();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = connection.read_datagram() => next,
        };

        match next {
            Ok(Some(data)) => match ControlSignal::parse(&data) {
                Ok(signal) => {
                    trace!("Control {:?} from {}", signal, participant);
                    inbound.events.emit(SessionEventKind::Control(signal));
                }
                Err(AppError::UnknownControlType(id)) => {
                    warn_throttled!(
                        inbound.throttler,
                        "unknown_control",
                        "Unknown control type 0x{:02X} from {}",
                        id,
                        participant
                    );
                }
                Err(e) => {
                    warn_throttled!(inbound.throttler, "bad_control", "Bad control datagram from {}: {}", participant, e);
                }
            },
            Ok(None) => break,
            Err(e) => {
                if !cancel.is_cancelled() {
                    inbound
                        .events
                        .emit(SessionEventKind::Failed(AppError::DatagramRead(e.to_string())));
                }
                break;
            }
        }
    }
    debug!("Datagram loop for {} stopped", participant);
}
