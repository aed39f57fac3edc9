//! Queue adapter over NATS JetStream: durable bid-placed, notification and
//! audit topics, a dead-letter stream, and pull consumers with a bounded
//! ack-pending window so one worker cannot starve its peers.
//!
//! When the broker is unreachable at startup the adapter initializes
//! disabled: publishes are dropped with a warning and consumers are never
//! started. Bid submission then falls back to the HTTP path.

use {
    crate::events::{
        AuditEntry,
        BidEnvelope,
        Notification,
    },
    anyhow::{
        anyhow,
        Result,
    },
    async_nats::jetstream::{
        self,
        consumer::pull,
        stream::{
            Config as StreamConfig,
            RetentionPolicy,
            StorageType,
        },
        AckKind,
    },
    futures::StreamExt,
    serde::Serialize,
    std::time::Duration,
};

/// Per-message TTL on the main queues (5 minutes).
const MAIN_STREAM_MAX_AGE: Duration = Duration::from_secs(300);
/// Dead-lettered messages are kept for a day for out-of-band inspection.
const DEAD_LETTER_MAX_AGE: Duration = Duration::from_secs(86_400);

const BID_PLACED_SUBJECT: &str = "auction.events.bid.placed";
const DEAD_LETTER_PREFIX: &str = "dlq";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Topic {
    BidPlaced,
    Notifications,
    Audit,
}

impl Topic {
    fn stream_name(&self) -> &'static str {
        match self {
            Topic::BidPlaced => "AUCTION_EVENTS",
            Topic::Notifications => "NOTIFICATIONS",
            Topic::Audit => "AUDIT",
        }
    }

    fn subjects(&self) -> Vec<String> {
        match self {
            Topic::BidPlaced => vec!["auction.events.>".to_string()],
            Topic::Notifications => vec!["notify.>".to_string()],
            Topic::Audit => vec!["audit.>".to_string()],
        }
    }

    fn durable_name(&self) -> &'static str {
        match self {
            Topic::BidPlaced => "bid-processor",
            Topic::Notifications => "notification-consumer",
            Topic::Audit => "audit-consumer",
        }
    }

    fn filter_subject(&self) -> String {
        match self {
            Topic::BidPlaced => BID_PLACED_SUBJECT.to_string(),
            Topic::Notifications => "notify.>".to_string(),
            Topic::Audit => "audit.>".to_string(),
        }
    }
}

struct QueueInner {
    jetstream: jetstream::Context,
}

#[derive(Clone)]
pub struct Queue {
    inner:    Option<std::sync::Arc<QueueInner>>,
    prefetch: i64,
}

impl Queue {
    /// Connect and ensure the stream topology. Any setup failure yields a
    /// disabled adapter rather than a startup abort.
    pub async fn connect(nats_url: &str, prefetch: i64) -> Self {
        match Self::setup(nats_url).await {
            Ok(jetstream) => Self {
                inner: Some(std::sync::Arc::new(QueueInner { jetstream })),
                prefetch,
            },
            Err(err) => {
                tracing::warn!(
                    error = ?err,
                    "Queue broker unreachable, continuing with queueing disabled."
                );
                Self {
                    inner: None,
                    prefetch,
                }
            }
        }
    }

    async fn setup(nats_url: &str) -> Result<jetstream::Context> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|err| anyhow!("Failed to connect to queue broker: {err}"))?;
        let jetstream = jetstream::new(client);

        for topic in [Topic::BidPlaced, Topic::Notifications, Topic::Audit] {
            jetstream
                .get_or_create_stream(StreamConfig {
                    name: topic.stream_name().to_string(),
                    subjects: topic.subjects(),
                    retention: RetentionPolicy::Limits,
                    storage: StorageType::File,
                    max_age: MAIN_STREAM_MAX_AGE,
                    ..Default::default()
                })
                .await
                .map_err(|err| anyhow!("Failed to ensure stream {}: {err}", topic.stream_name()))?;
        }
        jetstream
            .get_or_create_stream(StreamConfig {
                name: "DEAD_LETTER".to_string(),
                subjects: vec![format!("{}.>", DEAD_LETTER_PREFIX)],
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                max_age: DEAD_LETTER_MAX_AGE,
                ..Default::default()
            })
            .await
            .map_err(|err| anyhow!("Failed to ensure dead-letter stream: {err}"))?;

        Ok(jetstream)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    async fn publish<T: Serialize>(&self, subject: String, payload: &T) -> Result<()> {
        let Some(inner) = &self.inner else {
            tracing::warn!(subject, "Queue disabled, dropping publish.");
            return Ok(());
        };
        let bytes = serde_json::to_vec(payload)?;
        inner
            .jetstream
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|err| anyhow!("Failed to publish to {subject}: {err}"))?
            .await
            .map_err(|err| anyhow!("Publish to {subject} was not acknowledged: {err}"))?;
        Ok(())
    }

    pub async fn publish_bid_placed(&self, envelope: &BidEnvelope) -> Result<()> {
        self.publish(BID_PLACED_SUBJECT.to_string(), envelope).await
    }

    pub async fn publish_notification(&self, notification: &Notification) -> Result<()> {
        self.publish(format!("notify.user.{}", notification.user_id), notification)
            .await
    }

    /// Best-effort: audit emission never blocks the acceptance path, so
    /// callers log failures instead of propagating them.
    pub async fn publish_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.publish(format!("audit.{}", entry.auction_id), entry).await
    }

    /// Durable pull consumer for a topic. `None` when the queue is disabled.
    pub async fn consumer_messages(&self, topic: Topic) -> Result<Option<QueueMessages>> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        let stream = inner
            .jetstream
            .get_stream(topic.stream_name())
            .await
            .map_err(|err| anyhow!("Failed to look up stream {}: {err}", topic.stream_name()))?;
        let consumer = stream
            .get_or_create_consumer(
                topic.durable_name(),
                pull::Config {
                    durable_name: Some(topic.durable_name().to_string()),
                    filter_subject: topic.filter_subject(),
                    max_ack_pending: self.prefetch,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| anyhow!("Failed to create consumer {}: {err}", topic.durable_name()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| anyhow!("Failed to open consumer stream: {err}"))?;
        Ok(Some(QueueMessages { messages }))
    }

    /// The nack-without-requeue path: copy the message onto the dead-letter
    /// stream, then terminally acknowledge the original.
    pub async fn dead_letter(&self, message: &QueueMessage) -> Result<()> {
        let subject = format!("{}.{}", DEAD_LETTER_PREFIX, message.subject());
        if let Some(inner) = &self.inner {
            inner
                .jetstream
                .publish(subject.clone(), message.inner.payload.clone())
                .await
                .map_err(|err| anyhow!("Failed to dead-letter to {subject}: {err}"))?
                .await
                .map_err(|err| anyhow!("Dead-letter to {subject} was not acknowledged: {err}"))?;
        }
        message.term().await
    }
}

pub struct QueueMessages {
    messages: pull::Stream,
}

impl QueueMessages {
    pub async fn next(&mut self) -> Option<Result<QueueMessage>> {
        match self.messages.next().await? {
            Ok(inner) => Some(Ok(QueueMessage { inner })),
            Err(err) => Some(Err(anyhow!("Consumer stream error: {err}"))),
        }
    }
}

pub struct QueueMessage {
    inner: jetstream::Message,
}

impl QueueMessage {
    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn subject(&self) -> &str {
        self.inner.subject.as_str()
    }

    pub async fn ack(&self) -> Result<()> {
        self.inner
            .ack()
            .await
            .map_err(|err| anyhow!("Failed to ack message: {err}"))
    }

    /// Terminal negative acknowledgement; the broker will not redeliver.
    pub async fn term(&self) -> Result<()> {
        self.inner
            .ack_with(AckKind::Term)
            .await
            .map_err(|err| anyhow!("Failed to term message: {err}"))
    }
}
