//! Message topic sink: one keyed JSON message per change.

use super::Sink;
use crate::config::MessageTopicConfig;
use crate::dispatch::{BatchOutcome, ItemFailure};
use crate::document::SinkDocument;
use crate::error::SyncResult;
use crate::mapping::OP_TYPE_FIELD;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Producer for a message topic.
pub trait MessageProducer: Send + Sync {
    /// Publishes `value` under `key` on `topic`.
    fn send(&self, topic: &str, key: &str, value: &Value) -> Result<(), String>;
}

impl<P: MessageProducer + ?Sized> MessageProducer for Box<P> {
    fn send(&self, topic: &str, key: &str, value: &Value) -> Result<(), String> {
        (**self).send(topic, key, value)
    }
}

impl<P: MessageProducer + ?Sized> MessageProducer for std::sync::Arc<P> {
    fn send(&self, topic: &str, key: &str, value: &Value) -> Result<(), String> {
        (**self).send(topic, key, value)
    }
}

/// Publishes changes to one topic.
///
/// Ordered per-key delivery replaces the freshness check of the search
/// sink, so this sink needs the dedup cache.
pub struct MessageTopicSink<P: MessageProducer> {
    producer: P,
    config: MessageTopicConfig,
}

impl<P: MessageProducer> MessageTopicSink<P> {
    /// Creates a sink.
    pub fn new(producer: P, config: MessageTopicConfig) -> Self {
        Self { producer, config }
    }

    /// Destination settings.
    pub fn config(&self) -> &MessageTopicConfig {
        &self.config
    }

    /// Underlying producer.
    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Message body of a document.
    pub fn payload(document: &SinkDocument) -> Value {
        let mut body = document.fields.to_json();
        body.insert(OP_TYPE_FIELD.into(), Value::from(document.operation.as_str()));
        Value::Object(body)
    }
}

impl<P: MessageProducer> Sink for MessageTopicSink<P> {
    fn destination_id(&self) -> &str {
        &self.config.topic
    }

    fn dedup_namespace(&self) -> &str {
        &self.config.cluster_id
    }

    fn requires_dedup(&self) -> bool {
        true
    }

    fn prepare(&self) -> SyncResult<()> {
        Ok(())
    }

    fn dispatch(&self, documents: &[SinkDocument]) -> SyncResult<BatchOutcome> {
        let mut outcome = BatchOutcome::new();
        for document in documents {
            let key = self.identity_key(&document.account, &document.container, &document.object);
            if let Err(e) = self.producer.send(&self.config.topic, &key, &Self::payload(document)) {
                warn!(key = %key, error = %e, "message send failed");
                outcome.failures.push(ItemFailure::new(
                    key,
                    format!("Failed to send message about {}", document.path()),
                ));
                break;
            }
            debug!(key = %key, op = %document.operation, "sent message");
            outcome.delivered.push(document.id());
        }
        Ok(outcome)
    }
}

/// In-memory [`MessageProducer`] recording every message.
#[derive(Debug, Default)]
pub struct MockProducer {
    sent: Mutex<Vec<(String, String, Value)>>,
    failing_keys: Mutex<HashSet<String>>,
}

impl MockProducer {
    /// Creates a producer that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sends for `key` time out.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().insert(key.into());
    }

    /// Messages sent so far as `(topic, key, value)`.
    pub fn sent(&self) -> Vec<(String, String, Value)> {
        self.sent.lock().clone()
    }
}

impl MessageProducer for MockProducer {
    fn send(&self, topic: &str, key: &str, value: &Value) -> Result<(), String> {
        if self.failing_keys.lock().contains(key) {
            return Err("timed out waiting for broker acknowledgement".into());
        }
        self.sent
            .lock()
            .push((topic.to_string(), key.to_string(), value.clone()));
        Ok(())
    }
}
