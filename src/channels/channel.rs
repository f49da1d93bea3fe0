//! Channel trait — inbound events and outbound render requests.
//!
//! The core is transport-agnostic: it consumes `IncomingEvent`s tagged
//! with a stable user identity and emits `OutgoingMessage` render
//! requests. A channel implementation owns the wire details.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;

/// The kinds of inbound events a channel can deliver.
#[derive(Debug, Clone)]
pub enum IncomingKind {
    /// A plain text message.
    Text(String),
    /// A photo, already downloaded to raw bytes.
    Photo(Vec<u8>),
    /// An inline button press carrying its opaque tag.
    Button(String),
}

/// An inbound event tagged with a stable user identity.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    /// Channel name this event arrived on.
    pub channel: String,
    /// Stable user identity within the channel.
    pub user_id: String,
    pub kind: IncomingKind,
    /// Channel-specific routing data (chat id, message id, ...).
    pub metadata: serde_json::Value,
}

impl IncomingEvent {
    pub fn new(channel: &str, user_id: &str, kind: IncomingKind) -> Self {
        Self {
            channel: channel.to_string(),
            user_id: user_id.to_string(),
            kind,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One inline button: a visible label and the opaque tag delivered back
/// when it is pressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub tag: String,
}

impl InlineButton {
    pub fn new(label: &str, tag: &str) -> Self {
        Self {
            label: label.to_string(),
            tag: tag.to_string(),
        }
    }
}

/// Keyboard specification attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keyboard {
    /// Persistent reply keyboard (rows of text labels).
    Reply(Vec<Vec<String>>),
    /// Remove any persistent reply keyboard.
    Remove,
    /// Inline buttons attached to a single message.
    Inline(Vec<Vec<InlineButton>>),
}

/// An outbound render request.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    Text {
        text: String,
        keyboard: Option<Keyboard>,
    },
    Photo {
        data: Vec<u8>,
        caption: String,
        keyboard: Option<Keyboard>,
    },
    /// Replace the caption of the message the triggering button sat on.
    EditCaption {
        caption: String,
        keyboard: Option<Keyboard>,
    },
    /// Delete the message the triggering button sat on.
    DeleteMessage,
}

/// Boxed stream of inbound events from a channel.
pub type EventStream = Pin<Box<dyn Stream<Item = IncomingEvent> + Send>>;

/// A message transport the bot can serve.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name for logs and event tagging.
    fn name(&self) -> &str;

    /// Start listening; returns the inbound event stream.
    async fn start(&self) -> Result<EventStream, ChannelError>;

    /// Render an outbound message in reply to an inbound event.
    async fn respond(
        &self,
        event: &IncomingEvent,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError>;

    /// Verify the channel can reach its backend.
    async fn health_check(&self) -> Result<(), ChannelError>;

    /// Graceful shutdown.
    async fn shutdown(&self) -> Result<(), ChannelError>;
}
