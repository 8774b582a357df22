//! Duplex, length-framed message channel to a worker process.
//!
//! One send task and one receive task share the underlying byte streams, so
//! channel I/O is never contended by more than one writer or reader. The
//! send task drains a caller-fed queue in FIFO order; the receive task
//! parses frames and offers them to a bounded queue, retrying indefinitely
//! rather than dropping. Stopping injects the poison sentinel so blocked
//! `receive()` calls wake with an explicit channel-closed error.

mod message;

pub use message::{is_poison, Message, MessageKind};

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};

/// Outbound queue depth; senders block here under transport backpressure.
const OUTBOUND_QUEUE: usize = 256;

/// Inbound queue depth before the receive loop starts its retry-offer.
const INBOUND_QUEUE: usize = 64;

/// How long a single offer to the inbound queue waits before logging and
/// retrying.
const OFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single frame. Anything larger means the stream is
/// desynchronized.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Frame layout: `[frame_len u32 LE][id u32 LE][kind u8][payload]` where
/// `frame_len` covers id, kind and payload.
const FRAME_HEADER: u32 = 5;

/// Write one framed message and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> std::io::Result<()> {
    let frame_len = FRAME_HEADER + message.payload.len() as u32;
    writer.write_u32_le(frame_len).await?;
    writer.write_u32_le(message.id).await?;
    writer.write_u8(message.kind.as_u8()).await?;
    writer.write_all(&message.payload).await?;
    writer.flush().await
}

/// Read one framed message. Returns `None` on clean end-of-stream at a
/// frame boundary; a partial frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len < FRAME_HEADER || frame_len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid frame length {}", frame_len),
        ));
    }
    let id = reader.read_u32_le().await?;
    let kind_tag = reader.read_u8().await?;
    let kind = MessageKind::from_u8(kind_tag).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown message kind 0x{:02X}", kind_tag),
        )
    })?;
    let mut payload = vec![0u8; (frame_len - FRAME_HEADER) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Message::new(id, kind, payload)))
}

/// A running duplex channel: one send loop, one receive loop, shared
/// failure state.
pub struct MessageChannel {
    outbound: mpsc::Sender<Arc<Message>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Arc<Message>>>,
    poison: Arc<Message>,
    stop: CancellationToken,
    failure: Arc<StdMutex<Option<String>>>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl MessageChannel {
    /// Spawn the send and receive loops over the given transport halves.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let poison = Message::poison();
        let stop = CancellationToken::new();
        let failure = Arc::new(StdMutex::new(None));

        let (out_tx, out_rx) = mpsc::channel::<Arc<Message>>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<Arc<Message>>(INBOUND_QUEUE);

        let send_task = tokio::spawn(send_loop(
            writer,
            out_rx,
            poison.clone(),
            stop.clone(),
            failure.clone(),
        ));
        let recv_task = tokio::spawn(receive_loop(
            reader,
            in_tx,
            poison.clone(),
            stop.clone(),
            failure.clone(),
        ));

        Self {
            outbound: out_tx,
            inbound: tokio::sync::Mutex::new(in_rx),
            poison,
            stop,
            failure,
            send_task,
            recv_task,
        }
    }

    /// Enqueue a message for the send loop. Blocks when the outbound queue
    /// is saturated by transport backpressure.
    pub async fn send(&self, message: Message) -> Result<()> {
        if let Some(reason) = self.failure_reason() {
            return Err(WorkerError::Channel(reason));
        }
        if self.stop.is_cancelled() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(Arc::new(message))
            .await
            .map_err(|_| self.closed_error())
    }

    /// Take the next inbound message. Wakes with a channel-closed error
    /// when the loops have been stopped or the transport failed, instead of
    /// hanging.
    pub async fn receive(&self) -> Result<Arc<Message>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            message = inbound.recv() => match message {
                Some(m) if is_poison(&m, &self.poison) => Err(self.closed_error()),
                Some(m) => Ok(m),
                None => Err(self.closed_error()),
            },
            _ = self.stop.cancelled() => Err(self.closed_error()),
        }
    }

    /// Stop both loops. Pending outbound frames are given a short grace to
    /// flush, then everything blocked on this channel is woken.
    pub async fn close(&self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            self.outbound.send(self.poison.clone()),
        )
        .await;
        self.stop.cancel();
    }

    /// Terminal failure reason, if a loop hit an I/O error.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.lock().expect("failure lock poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn closed_error(&self) -> WorkerError {
        match self.failure_reason() {
            Some(reason) => WorkerError::Channel(reason),
            None => WorkerError::Channel("message channel closed".into()),
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.stop.cancel();
        self.send_task.abort();
        self.recv_task.abort();
    }
}

async fn send_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Arc<Message>>,
    poison: Arc<Message>,
    stop: CancellationToken,
    failure: Arc<StdMutex<Option<String>>>,
) {
    loop {
        let message = tokio::select! {
            message = out_rx.recv() => message,
            _ = stop.cancelled() => break,
        };
        let Some(message) = message else { break };
        if is_poison(&message, &poison) {
            break;
        }
        if let Err(e) = write_frame(&mut writer, &message).await {
            record_failure(&failure, &stop, format!("failed to write frame: {}", e));
            break;
        }
    }
    tracing::debug!("send loop stopped");
}

async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    in_tx: mpsc::Sender<Arc<Message>>,
    poison: Arc<Message>,
    stop: CancellationToken,
    failure: Arc<StdMutex<Option<String>>>,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = stop.cancelled() => break,
        };
        match frame {
            Ok(Some(message)) => {
                let message = Arc::new(message);
                // Timed offer with indefinite retry: a slow consumer delays
                // us but never loses a message.
                loop {
                    match in_tx.send_timeout(message.clone(), OFFER_TIMEOUT).await {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(_)) => {
                            tracing::debug!(
                                timeout_ms = OFFER_TIMEOUT.as_millis() as u64,
                                "inbound queue full, continuing to wait"
                            );
                        }
                        Err(SendTimeoutError::Closed(_)) => return,
                    }
                }
            }
            Ok(None) => {
                if !stop.is_cancelled() {
                    record_failure(&failure, &stop, "transport closed by worker".into());
                }
                break;
            }
            Err(e) => {
                record_failure(&failure, &stop, format!("failed to read frame: {}", e));
                break;
            }
        }
    }
    // Wake any blocked receive() even if the stop token is not yet seen.
    let _ = in_tx.try_send(poison);
    tracing::debug!("receive loop stopped");
}

fn record_failure(failure: &StdMutex<Option<String>>, stop: &CancellationToken, reason: String) {
    {
        let mut slot = failure.lock().expect("failure lock poisoned");
        if slot.is_none() {
            tracing::warn!(reason = %reason, "message channel failed");
            *slot = Some(reason);
        }
    }
    stop.cancel();
}
