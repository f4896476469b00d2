use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, StompError};
use crate::frame::Frame;
use crate::operation::Operation;
use crate::session::Session;

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

/// Per-subscription settings forwarded in the SUBSCRIBE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub ack: AckMode,
    /// Extra SUBSCRIBE headers (selectors, broker-specific durable names).
    pub headers: Vec<(String, String)>,
    /// When set, subscribe to this destination instead of the one given.
    pub durable_queue: Option<String>,
}

impl SubscriptionOptions {
    pub fn ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Callback invoked once per MESSAGE routed to a subscription.
pub type MessageHandler = Arc<dyn Fn(Frame) + Send + Sync>;

struct SubscriptionEntry {
    destination: String,
    ack: AckMode,
    handler: MessageHandler,
}

/// Outcome of routing a MESSAGE frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No active subscription claims the frame; it is handed back.
    Unrouted(Frame),
}

/// Maps subscription ids to their destination and handler.
///
/// Ids are `sub-<n>`, allocated from a counter that starts at zero and never
/// goes back, so an id is never reused for a different subscription even
/// after it is removed.
pub struct SubscriptionRegistry {
    next_id: u64,
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    /// Register a handler for `destination` and return the new id.
    pub fn subscribe(&mut self, destination: &str, ack: AckMode, handler: MessageHandler) -> String {
        let id = format!("sub-{}", self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id.clone(),
            SubscriptionEntry {
                destination: destination.to_string(),
                ack,
                handler,
            },
        );
        id
    }

    /// Remove a subscription, returning its destination.
    pub fn unsubscribe(&mut self, id: &str) -> Result<String> {
        self.entries
            .remove(id)
            .map(|e| e.destination)
            .ok_or_else(|| StompError::violation(format!("subscription id '{}' not found", id)))
    }

    pub fn destination(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|e| e.destination.as_str())
    }

    pub fn ack_mode(&self, id: &str) -> Option<AckMode> {
        self.entries.get(id).map(|e| e.ack)
    }

    /// The handler a MESSAGE frame should go to, by its `subscription` header.
    pub fn handler_for(&self, frame: &Frame) -> Option<MessageHandler> {
        let id = frame.get_header("subscription")?;
        self.entries.get(id).map(|e| Arc::clone(&e.handler))
    }

    /// Route and deliver a MESSAGE frame in the caller's context.
    pub fn dispatch(&self, frame: Frame) -> Dispatch {
        match self.handler_for(&frame) {
            Some(handler) => {
                handler(frame);
                Dispatch::Delivered
            }
            None => Dispatch::Unrouted(frame),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("next_id", &self.next_id)
            .field("active", &self.entries.len())
            .finish()
    }
}

/// A lightweight handle returned from `Session::subscribe_channel` that
/// packages the subscription id, destination, and the receiving side of the
/// subscription.
pub struct Subscription {
    id: String,
    destination: String,
    receiver: mpsc::UnboundedReceiver<Frame>,
    session: Session,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        destination: String,
        receiver: mpsc::UnboundedReceiver<Frame>,
        session: Session,
    ) -> Self {
        Self {
            id,
            destination,
            receiver,
            session,
        }
    }

    /// Returns the local subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the destination this subscription listens to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next delivered MESSAGE, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Consume the `Subscription` and return the underlying receiver so the
    /// caller can drive message handling directly.
    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<Frame> {
        self.receiver
    }

    /// Acknowledge `message`, using its `ack` header (1.2) or `message-id`.
    pub async fn ack(&self, message: &Frame) -> Result<Operation> {
        self.session.ack(ack_id(message)?, None).await
    }

    /// Negative-acknowledge `message`.
    pub async fn nack(&self, message: &Frame) -> Result<Operation> {
        self.session.nack(ack_id(message)?, None).await
    }

    pub async fn unsubscribe(self) -> Result<Operation> {
        self.session.unsubscribe(&self.id).await
    }
}

fn ack_id(message: &Frame) -> Result<&str> {
    message
        .get_header("ack")
        .or_else(|| message.get_header("message-id"))
        .ok_or_else(|| StompError::violation("message carries neither 'ack' nor 'message-id'"))
}
