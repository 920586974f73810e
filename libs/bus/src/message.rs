//! Fact messages and consumers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use tilth_reconcile::Mark;

/// A fact snapshot from one source.
#[derive(Clone)]
pub struct Message {
    id: String,
    payload: Option<BTreeMap<String, String>>,
}

impl Message {
    /// Create a message. `None` produces an empty message.
    pub fn new(id: impl Into<String>, payload: Option<BTreeMap<String, String>>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// An empty message for `id`.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, None)
    }

    /// Build a message from string pairs.
    pub fn from_pairs<I, K, V>(id: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            id,
            Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when the source has nothing to report.
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// The payload, if any.
    pub fn payload(&self) -> Option<&BTreeMap<String, String>> {
        self.payload.as_ref()
    }

    /// The payload, or an empty map for empty messages.
    pub fn payload_map(&self) -> BTreeMap<String, String> {
        self.payload.clone().unwrap_or_default()
    }

    /// Mark of the payload. Empty messages have no mark.
    pub fn payload_mark(&self) -> Option<Mark> {
        self.payload.as_ref().map(Mark::from_map)
    }

    /// Payload equality.
    pub fn is_equal(&self, other: &Message) -> bool {
        self.payload == other.payload
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{}:{:?}", self.id, payload),
            None => write!(f, "{}:<empty>", self.id),
        }
    }
}

/// Anything that accepts fact messages.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume_message(&self, message: Message);
}

/// Consumer that records every message it receives.
#[derive(Default)]
pub struct RecordingConsumer {
    messages: Mutex<Vec<Message>>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far, in order.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    async fn consume_message(&self, message: Message) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
    }
}
