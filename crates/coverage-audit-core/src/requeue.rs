//! Reprocessing requests for missing work.
//!
//! [`RequeuePublisher`] forwards run keys to a [`WorkQueue`] and remembers
//! every key it has accepted in its [`SentForRerun`] set, so a key is
//! enqueued at most once per publisher lifetime. Nothing is persisted: a
//! new process starts with an empty set and may enqueue the same key again.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::error::Result;
use crate::domain::work::RunKey;
use crate::metrics::METRICS;
use crate::obs;
use crate::query::http::{build_client, post_json};

/// Bucket holding the normalized task records that reprocessing reads from.
pub const DEFAULT_SOURCE_BUCKET: &str = "active-data-task-cluster-normalized";

/// Bucket the coverage ingestion writes to.
pub const DEFAULT_DESTINATION_BUCKET: &str = "active-data-codecoverage";

/// One outbound reprocessing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequeueMessage {
    pub key: String,
    pub bucket: String,
    pub destination: String,
    /// Epoch seconds.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Outbound work queue.
///
/// Implement this trait to plug in a real queue, a dry-run logger, or a test
/// recorder.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue all `messages` as one operation.
    async fn extend(&self, messages: Vec<RequeueMessage>) -> Result<()>;
}

/// Work queue reached over HTTP: the message batch is POSTed as a JSON array.
pub struct HttpWorkQueue {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpWorkQueue {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(HttpWorkQueue {
            endpoint: endpoint.to_string(),
            client: build_client()?,
        })
    }
}

#[async_trait]
impl WorkQueue for HttpWorkQueue {
    async fn extend(&self, messages: Vec<RequeueMessage>) -> Result<()> {
        post_json(&self.client, &self.endpoint, &messages).await?;
        Ok(())
    }
}

/// Logs what would be enqueued and sends nothing.
#[derive(Debug, Default)]
pub struct DryRunQueue;

#[async_trait]
impl WorkQueue for DryRunQueue {
    async fn extend(&self, messages: Vec<RequeueMessage>) -> Result<()> {
        for message in &messages {
            info!(key = %message.key, bucket = %message.bucket, "dry run: would requeue");
        }
        Ok(())
    }
}

/// Run keys already handed to the work queue during this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentForRerun {
    keys: BTreeSet<RunKey>,
}

impl SentForRerun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `keys` and return those not seen before, in key order.
    pub fn admit(&mut self, keys: &BTreeSet<RunKey>) -> Vec<RunKey> {
        keys.iter()
            .filter(|k| self.keys.insert((*k).clone()))
            .cloned()
            .collect()
    }

    pub fn contains(&self, key: &RunKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// De-duplicating front end to a [`WorkQueue`].
pub struct RequeuePublisher {
    queue: Arc<dyn WorkQueue>,
    sent: SentForRerun,
    source_bucket: String,
    destination_bucket: String,
}

impl RequeuePublisher {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            queue,
            sent: SentForRerun::new(),
            source_bucket: DEFAULT_SOURCE_BUCKET.to_string(),
            destination_bucket: DEFAULT_DESTINATION_BUCKET.to_string(),
        }
    }

    pub fn with_buckets(mut self, source: &str, destination: &str) -> Self {
        self.source_bucket = source.to_string();
        self.destination_bucket = destination.to_string();
        self
    }

    /// Keys accepted so far.
    pub fn sent(&self) -> &SentForRerun {
        &self.sent
    }

    /// Enqueue the keys of `keys` not already sent, as one extend call.
    ///
    /// Keys are recorded as sent before the queue is called; a failed call
    /// is fatal and the whole reconciliation is expected to be rerun. Makes
    /// no queue call when every key was already sent. Returns the keys
    /// actually enqueued.
    pub async fn publish(&mut self, keys: &BTreeSet<RunKey>) -> Result<Vec<RunKey>> {
        let net_new = self.sent.admit(keys);
        if net_new.is_empty() {
            return Ok(net_new);
        }

        let now = Utc::now();
        let messages = net_new
            .iter()
            .map(|key| RequeueMessage {
                key: key.to_string(),
                bucket: self.source_bucket.clone(),
                destination: self.destination_bucket.clone(),
                timestamp: now,
            })
            .collect();

        obs::emit_requeue_sent(&net_new);
        self.queue.extend(messages).await?;
        METRICS.add_runs_requeued(net_new.len() as u64);
        Ok(net_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryWorkQueue;

    fn keys(ids: &[&str]) -> BTreeSet<RunKey> {
        ids.iter().map(|id| RunKey::from(*id)).collect()
    }

    #[tokio::test]
    async fn test_overlapping_publishes_send_each_key_once() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let mut publisher = RequeuePublisher::new(queue.clone());

        publisher.publish(&keys(&["x", "y"])).await.unwrap();
        publisher.publish(&keys(&["y", "z"])).await.unwrap();

        let calls = queue.calls();
        assert_eq!(calls.len(), 2);
        let first: Vec<_> = calls[0].iter().map(|m| m.key.as_str()).collect();
        let second: Vec<_> = calls[1].iter().map(|m| m.key.as_str()).collect();
        assert_eq!(first, ["x", "y"]);
        assert_eq!(second, ["z"]);
    }

    #[tokio::test]
    async fn test_nothing_new_makes_no_queue_call() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let mut publisher = RequeuePublisher::new(queue.clone());

        publisher.publish(&keys(&["x"])).await.unwrap();
        let sent = publisher.publish(&keys(&["x"])).await.unwrap();
        assert!(sent.is_empty());
        publisher.publish(&BTreeSet::new()).await.unwrap();

        assert_eq!(queue.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_message_fields() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let mut publisher = RequeuePublisher::new(queue.clone()).with_buckets("src", "dst");
        publisher.publish(&keys(&["tc.1"])).await.unwrap();

        let message = &queue.calls()[0][0];
        assert_eq!(message.key, "tc.1");
        assert_eq!(message.bucket, "src");
        assert_eq!(message.destination, "dst");
        let json = serde_json::to_value(message).unwrap();
        assert!(json["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_failed_extend_still_marks_keys_sent() {
        let queue = Arc::new(MemoryWorkQueue::failing());
        let mut publisher = RequeuePublisher::new(queue.clone());
        assert!(publisher.publish(&keys(&["x"])).await.is_err());
        assert!(publisher.sent().contains(&RunKey::from("x")));
    }

    #[test]
    fn test_sent_for_rerun_grows_monotonically() {
        let mut sent = SentForRerun::new();
        assert_eq!(sent.admit(&keys(&["a", "b"])).len(), 2);
        assert_eq!(sent.admit(&keys(&["b", "c"])), vec![RunKey::from("c")]);
        assert_eq!(sent.len(), 3);
    }
}
