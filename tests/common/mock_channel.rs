//! In-process message channel for integration tests.

use consistency_engine::channel::MessageChannel;
use consistency_engine::error::ConsistencyError;
use consistency_engine::Result;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One published message with its assigned stream-style ID.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub id: String,
    pub payload: Vec<u8>,
}

/// Channel that records publishes in order and can simulate an outage.
pub struct MockChannel {
    published: Mutex<Vec<PublishedMessage>>,
    next_seq: AtomicU64,
    down: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

impl MessageChannel for MockChannel {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        let topic = topic.to_string();
        Box::pin(async move {
            if self.down.load(Ordering::SeqCst) {
                return Err(ConsistencyError::channel_msg(topic, "channel unavailable"));
            }
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let id = format!("{}-0", seq);
            self.published.lock().unwrap().push(PublishedMessage {
                topic,
                id: id.clone(),
                payload,
            });
            Ok(id)
        })
    }
}
