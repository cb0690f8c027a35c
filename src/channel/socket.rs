//! # JSON-lines channel with callback correlation.
//!
//! [`JsonLinesChannel`] implements [`MessageChannel`] over any byte stream:
//! each frame is one JSON object per line.
//!
//! ## Frames
//! ```text
//! host → worker   {"direction":"call","name":"init","callbackId":1,"payload":{…}}
//! worker → host   {"direction":"response","callbackId":1,"success":true,"payload":{…}}
//! worker → host   {"direction":"call","name":"register","callbackId":7,"payload":{…}}
//! host → worker   {"direction":"response","callbackId":7,"success":true,"payload":{}}
//! ```
//!
//! Outbound calls allocate a callback id and park a oneshot in the pending
//! map; the read loop resolves it when the matching response arrives.
//! Responses may arrive in any order. Worker-initiated calls are forwarded to
//! the owner (they surface as process `Message` events). When the stream
//! ends, every pending call fails with [`ChannelError::Closed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{InboundMessage, MessageChannel};
use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    Call,
    Response,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    callback_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

type PendingMap = parking_lot::Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>;

/// [`MessageChannel`] over a newline-delimited JSON stream.
pub struct JsonLinesChannel {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<PendingMap>,
    next_callback_id: AtomicU64,
}

impl JsonLinesChannel {
    /// Wraps `stream` and spawns the read loop.
    ///
    /// Worker-initiated calls are forwarded through `inbound`; the loop stops
    /// when the stream ends or `cancel` fires, failing all pending calls.
    pub fn new<S>(
        stream: S,
        inbound: mpsc::UnboundedSender<InboundMessage>,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = io::split(stream);
        let pending: Arc<PendingMap> = Arc::new(parking_lot::Mutex::new(HashMap::new()));

        let channel = Arc::new(Self {
            writer: Mutex::new(Box::new(write_half)),
            pending: Arc::clone(&pending),
            next_callback_id: AtomicU64::new(1),
        });

        tokio::spawn(read_loop(read_half, pending, inbound, cancel));

        channel
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for JsonLinesChannel {
    async fn send_with_callback(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let callback_id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(callback_id, tx);

        let frame = Frame {
            direction: Direction::Call,
            name: Some(name.to_string()),
            callback_id: Some(callback_id),
            success: None,
            error: None,
            payload,
        };
        if let Err(err) = self.write_frame(&frame).await {
            self.pending.lock().remove(&callback_id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(message)) => Err(ChannelError::Remote(message)),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    async fn respond(
        &self,
        callback_id: u64,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), ChannelError> {
        let frame = match result {
            Ok(payload) => Frame {
                direction: Direction::Response,
                name: None,
                callback_id: Some(callback_id),
                success: Some(true),
                error: None,
                payload,
            },
            Err(message) => Frame {
                direction: Direction::Response,
                name: None,
                callback_id: Some(callback_id),
                success: Some(false),
                error: Some(message),
                payload: serde_json::Value::Null,
            },
        };
        self.write_frame(&frame).await
    }
}

async fn read_loop<R>(
    read_half: R,
    pending: Arc<PendingMap>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "discarding malformed channel frame");
                continue;
            }
        };

        match frame.direction {
            Direction::Call => {
                let Some(name) = frame.name else { continue };
                let _ = inbound.send(InboundMessage {
                    name,
                    callback_id: frame.callback_id,
                    payload: frame.payload,
                });
            }
            Direction::Response => {
                let Some(callback_id) = frame.callback_id else { continue };
                let Some(tx) = pending.lock().remove(&callback_id) else {
                    continue;
                };
                let result = if frame.success.unwrap_or(false) {
                    Ok(frame.payload)
                } else {
                    Err(frame
                        .error
                        .unwrap_or_else(|| "module call failed".to_string()))
                };
                let _ = tx.send(result);
            }
        }
    }

    // Fail everything still in flight; the process behind the stream is gone.
    pending.lock().clear();
}
