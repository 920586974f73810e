//! Composite pipes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::message::{Consumer, Message};

/// Merges several fact sources into one message.
///
/// The pipe remembers the latest message of every declared source. While any
/// of them is missing or empty it forwards an empty message; once all of them
/// carry facts it forwards one message whose keys are prefixed with the
/// source id (`meta` + `rack` becomes `meta.rack`). Messages from sources
/// that were not declared are dropped.
pub struct StrictPipe {
    id: String,
    sources: Vec<String>,
    downstream: Arc<dyn Consumer>,
    latest: Mutex<BTreeMap<String, Message>>,
}

impl StrictPipe {
    pub fn new<I, S>(id: impl Into<String>, downstream: Arc<dyn Consumer>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            sources: sources.into_iter().map(Into::into).collect(),
            downstream,
            latest: Mutex::new(BTreeMap::new()),
        }
    }

    fn merge(&self, latest: &BTreeMap<String, Message>) -> Message {
        let mut merged = BTreeMap::new();
        for source in &self.sources {
            let Some(payload) = latest.get(source).and_then(Message::payload) else {
                return Message::empty(&self.id);
            };
            for (k, v) in payload {
                merged.insert(format!("{source}.{k}"), v.clone());
            }
        }
        Message::new(&self.id, Some(merged))
    }
}

#[async_trait]
impl Consumer for StrictPipe {
    async fn consume_message(&self, message: Message) {
        if !self.sources.iter().any(|s| s == message.id()) {
            debug!(
                pipe = %self.id,
                source = %message.id(),
                "Dropping message from undeclared source"
            );
            return;
        }
        // Held across the forward so downstream sees messages in arrival order.
        let mut latest = self.latest.lock().await;
        latest.insert(message.id().to_string(), message);
        let merged = self.merge(&latest);
        trace!(pipe = %self.id, message = ?merged, "Forwarding merged facts");
        self.downstream.consume_message(merged).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RecordingConsumer;

    #[tokio::test]
    async fn test_strict_pipe() {
        let recorder = Arc::new(RecordingConsumer::new());
        let pipe = StrictPipe::new("test", recorder.clone(), ["1", "2"]);

        pipe.consume_message(Message::from_pairs("1", [("1", "1")])).await;
        assert_eq!(recorder.messages(), vec![Message::empty("test")]);

        pipe.consume_message(Message::from_pairs("2", [("2", "2")])).await;
        assert_eq!(
            recorder.messages().last(),
            Some(&Message::from_pairs("test", [("1.1", "1"), ("2.2", "2")]))
        );

        pipe.consume_message(Message::empty("2")).await;
        assert_eq!(recorder.messages().last(), Some(&Message::empty("test")));

        pipe.consume_message(Message::from_pairs("2", [("2", "3")])).await;
        let messages = recorder.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[3],
            Message::from_pairs("test", [("1.1", "1"), ("2.2", "3")])
        );
        assert_eq!(messages[3].id(), "test");
    }

    #[tokio::test]
    async fn test_undeclared_source_dropped() {
        let recorder = Arc::new(RecordingConsumer::new());
        let pipe = StrictPipe::new("test", recorder.clone(), ["1"]);

        pipe.consume_message(Message::from_pairs("other", [("k", "v")])).await;
        assert!(recorder.messages().is_empty());
    }
}
