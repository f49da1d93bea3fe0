//! Bot runner — wires a channel to the dialog engine.
//!
//! Consumes the channel's event stream, persists inbound photos, feeds
//! events to the engine, and renders its replies back through the
//! channel. Each event is handled on its own task; per-user ordering is
//! enforced inside the engine, not here.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::channels::{Channel, IncomingEvent, IncomingKind, OutgoingMessage};
use crate::dialog::{DialogEngine, Event, Reply, ReplyKind};
use crate::error::Result;
use crate::photos::PhotoStore;

pub struct Bot {
    engine: Arc<DialogEngine>,
    photos: Arc<PhotoStore>,
    channel: Arc<dyn Channel>,
}

impl Bot {
    pub fn new(engine: DialogEngine, photos: PhotoStore, channel: Arc<dyn Channel>) -> Self {
        Self {
            engine: Arc::new(engine),
            photos: Arc::new(photos),
            channel,
        }
    }

    /// Run until the channel's event stream ends.
    pub async fn run(&self) -> Result<()> {
        self.channel.health_check().await?;
        info!(channel = self.channel.name(), "Channel healthy, starting");

        let mut stream = self.channel.start().await?;

        while let Some(event) = stream.next().await {
            let engine = Arc::clone(&self.engine);
            let photos = Arc::clone(&self.photos);
            let channel = Arc::clone(&self.channel);

            tokio::spawn(async move {
                if let Err(e) = dispatch(&engine, &photos, channel.as_ref(), event).await {
                    error!(error = %e, "Event dispatch failed");
                }
            });
        }

        info!(channel = self.channel.name(), "Event stream ended");
        self.channel.shutdown().await?;
        Ok(())
    }
}

/// Handle one inbound event end to end: persist any photo payload, apply
/// the event to the dialog engine, render the replies.
async fn dispatch(
    engine: &DialogEngine,
    photos: &PhotoStore,
    channel: &dyn Channel,
    incoming: IncomingEvent,
) -> Result<()> {
    let event = match &incoming.kind {
        IncomingKind::Text(text) => Event::Text(text.clone()),
        IncomingKind::Button(tag) => Event::Button(tag.clone()),
        IncomingKind::Photo(bytes) => {
            let photo_ref = photos.store(&incoming.user_id, bytes).await?;
            Event::Photo(photo_ref)
        }
    };

    let replies = engine.handle_event(&incoming.user_id, event).await;

    for reply in replies {
        let message = render(photos, reply).await;
        if let Err(e) = channel.respond(&incoming, message).await {
            warn!(
                channel = channel.name(),
                user_id = %incoming.user_id,
                error = %e,
                "Failed to deliver reply"
            );
        }
    }

    Ok(())
}

/// Resolve a reply into a channel message. A photo whose bytes cannot be
/// loaded degrades to a caption-only text message rather than dropping
/// the reply.
async fn render(photos: &PhotoStore, reply: Reply) -> OutgoingMessage {
    match reply.kind {
        ReplyKind::Text(text) => OutgoingMessage::Text {
            text,
            keyboard: reply.keyboard,
        },
        ReplyKind::EditCaption(caption) => OutgoingMessage::EditCaption {
            caption,
            keyboard: reply.keyboard,
        },
        ReplyKind::DeleteMessage => OutgoingMessage::DeleteMessage,
        ReplyKind::Photo { photo_ref, caption } => match photos.load(&photo_ref).await {
            Ok(data) => OutgoingMessage::Photo {
                data,
                caption,
                keyboard: reply.keyboard,
            },
            Err(e) => {
                warn!(photo_ref, error = %e, "Photo load failed; sending caption only");
                OutgoingMessage::Text {
                    text: caption,
                    keyboard: reply.keyboard,
                }
            }
        },
    }
}
