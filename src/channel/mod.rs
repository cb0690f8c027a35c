//! Message channel to a worker process.
//!
//! The host talks to each worker over a bidirectional channel with
//! request/callback semantics: the host sends named calls and awaits a
//! response; the worker sends its own calls (notably `register`), which
//! surface as [`InboundMessage`]s on the process event stream and are
//! answered with [`MessageChannel::respond`].
//!
//! [`MessageChannel`] is the seam: the supervisor hands each
//! [`ModuleClient`](crate::host::ModuleClient) a channel scoped to exactly
//! one worker, and the channel never outlives that worker's process.
//! [`socket::JsonLinesChannel`] is the shipped implementation.

mod messages;
pub mod socket;

pub use messages::*;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ChannelError;

/// A call sent by the worker to the host.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Message name (e.g. `register`).
    pub name: String,
    /// Callback id to answer with, when the worker expects a response.
    pub callback_id: Option<u64>,
    /// Raw payload.
    pub payload: serde_json::Value,
}

/// Bidirectional request/callback channel to one worker process.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Sends a named call and awaits the worker's response payload.
    ///
    /// Failures (stream gone, worker error response) surface as
    /// [`ChannelError`]; the channel itself stays usable unless closed.
    async fn send_with_callback(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError>;

    /// Answers a worker-initiated call identified by `callback_id`.
    async fn respond(
        &self,
        callback_id: u64,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), ChannelError>;
}

/// Sends a typed call over `channel` and decodes the typed response.
///
/// Encode/decode failures map to [`ChannelError::Codec`], which callers
/// treat like any other transport failure.
pub async fn call<Req, Resp>(
    channel: &dyn MessageChannel,
    name: &str,
    request: &Req,
) -> Result<Resp, ChannelError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_value(request)?;
    let response = channel.send_with_callback(name, payload).await?;
    Ok(serde_json::from_value(response)?)
}
