//! Redpanda transport for the account lease pool.
//!
//! Uses rdkafka (Kafka protocol) for three things:
//!
//! - [`RedpandaProducer`] publishes lease notifications
//!   ([`NotificationPublisher`]) and enqueues account resets ([`ResetQueue`])
//! - [`RedpandaSubscriber::change_feed`] consumes lease change records
//! - [`RedpandaSubscriber::reset_queue`] consumes reset requests
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits. Subscriber streams yield
//! [`Delivery`] items that carry the message's offset; nothing is committed
//! until the caller calls [`Delivery::commit`] (or commits the handle from
//! [`Delivery::into_parts`]) after handling the message. Messages still
//! buffered when the process dies are redelivered, so handlers must be
//! idempotent.
//!
//! Reset requests are keyed by account id, so all requests for one account
//! land on the same partition and are consumed in order.
//!
//! # Example
//!
//! ```no_run
//! use lease_pool_redpanda::{RedpandaProducer, RedpandaSubscriber};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let producer = RedpandaProducer::builder()
//!     .brokers("localhost:9092")
//!     .reset_topic("account-reset")
//!     .build()?;
//!
//! let subscriber = RedpandaSubscriber::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("lease-pool")
//!     .build()?;
//! let mut resets = subscriber.reset_queue("account-reset")?;
//! while let Some(delivery) = resets.next().await {
//!     if let Ok(account_id) = delivery.message() {
//!         println!("reset requested for {account_id}");
//!     }
//!     delivery.commit();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::{Stream, StreamExt};
use lease_pool_core::change_feed::ChangeRecord;
use lease_pool_core::notification::{NotificationMessage, NotificationPublisher, PublishError};
use lease_pool_core::reset_queue::{QueueError, ResetQueue};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default topic reset requests are written to.
pub const DEFAULT_RESET_TOPIC: &str = "account-reset";

/// Errors raised by the Redpanda transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedpandaError {
    /// A client could not be created.
    #[error("Redpanda connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscribing to a topic failed.
    #[error("Failed to subscribe to {topic}: {reason}")]
    SubscriptionFailed {
        /// Topic.
        topic: String,
        /// Client error.
        reason: String,
    },

    /// Receiving a message failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be decoded.
    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// Commits the offset of one consumed message.
pub trait OffsetCommit: Send + Sync {
    /// Mark the message as consumed for the consumer group.
    fn commit(&self);
}

/// A consumed message together with the handle that commits its offset.
///
/// Dropping a delivery without committing leaves the offset where it was,
/// so the message is read again after a restart or rebalance.
pub struct Delivery<T> {
    message: Result<T, RedpandaError>,
    commit: Option<Box<dyn OffsetCommit>>,
}

impl<T> Delivery<T> {
    /// A message whose offset is committed through `commit`.
    pub fn new(message: Result<T, RedpandaError>, commit: impl OffsetCommit + 'static) -> Self {
        Self {
            message,
            commit: Some(Box::new(commit)),
        }
    }

    /// A receive error with no offset behind it.
    #[must_use]
    pub fn uncommitted(error: RedpandaError) -> Self {
        Self {
            message: Err(error),
            commit: None,
        }
    }

    /// The decoded message, or why it could not be received or decoded.
    pub fn message(&self) -> Result<&T, &RedpandaError> {
        self.message.as_ref()
    }

    /// Decode the message, keeping the commit handle.
    #[must_use]
    pub fn and_then<U>(self, decode: impl FnOnce(T) -> Result<U, RedpandaError>) -> Delivery<U> {
        Delivery {
            message: self.message.and_then(decode),
            commit: self.commit,
        }
    }

    /// Commit the offset, if there is one.
    pub fn commit(self) {
        if let Some(commit) = self.commit {
            commit.commit();
        }
    }

    /// Split into the message and its commit handle.
    #[must_use]
    pub fn into_parts(self) -> (Result<T, RedpandaError>, Option<Box<dyn OffsetCommit>>) {
        (self.message, self.commit)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("committable", &self.commit.is_some())
            .finish()
    }
}

// Position of a received message; committing stores the next offset to read.
struct ConsumerOffset {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl OffsetCommit for ConsumerOffset {
    fn commit(&self) {
        let mut partitions = TopicPartitionList::new();
        let committed = partitions
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .and_then(|()| self.consumer.commit(&partitions, CommitMode::Async));
        if let Err(e) = committed {
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }
}

/// Stream of raw message payloads.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Delivery<Vec<u8>>> + Send>>;

/// Stream of decoded change records.
pub type ChangeRecordStream = Pin<Box<dyn Stream<Item = Delivery<ChangeRecord>> + Send>>;

/// Stream of account ids from the reset queue.
pub type ResetRequestStream = Pin<Box<dyn Stream<Item = Delivery<String>> + Send>>;

/// Message id returned by the producer: `<partition>:<offset>`.
#[must_use]
pub fn message_id(partition: i32, offset: i64) -> String {
    format!("{partition}:{offset}")
}

/// Decode a reset-queue payload into an account id.
///
/// # Errors
///
/// Returns [`RedpandaError::Decode`] if the payload is not UTF-8 or is blank.
pub fn decode_reset_request(payload: &[u8]) -> Result<String, RedpandaError> {
    let body = std::str::from_utf8(payload)
        .map_err(|e| RedpandaError::Decode(format!("reset request is not UTF-8: {e}")))?;
    let account_id = body.trim();
    if account_id.is_empty() {
        return Err(RedpandaError::Decode("reset request is empty".to_string()));
    }
    Ok(account_id.to_string())
}

/// Decode a change-feed payload.
///
/// # Errors
///
/// Returns [`RedpandaError::Decode`] if the payload is not a change record.
pub fn decode_change_record(payload: &[u8]) -> Result<ChangeRecord, RedpandaError> {
    ChangeRecord::from_json(payload).map_err(|e| RedpandaError::Decode(e.to_string()))
}

/// Producer for lease notifications and reset requests.
///
/// # Example
///
/// ```no_run
/// use lease_pool_redpanda::RedpandaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = RedpandaProducer::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaProducer {
    producer: FutureProducer,
    timeout: Duration,
    reset_topic: String,
}

impl std::fmt::Debug for RedpandaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaProducer")
            .field("timeout", &self.timeout)
            .field("reset_topic", &self.reset_topic)
            .finish_non_exhaustive()
    }
}

impl RedpandaProducer {
    /// Producer with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, RedpandaError> {
        Self::builder().brokers(brokers).build()
    }

    /// Builder for a configured producer.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }

    /// Topic reset requests are written to.
    #[must_use]
    pub fn reset_topic(&self) -> &str {
        &self.reset_topic
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<String, String> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(topic, partition, offset, "Message delivered");
                Ok(message_id(partition, offset))
            }
            Err((kafka_error, _)) => {
                tracing::error!(topic, error = %kafka_error, "Failed to deliver message");
                metrics::counter!("lease_pool.redpanda.send_failures", "topic" => topic.to_string())
                    .increment(1);
                Err(kafka_error.to_string())
            }
        }
    }
}

impl NotificationPublisher for RedpandaProducer {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a NotificationMessage,
    ) -> Pin<Box<dyn Future<Output = Result<String, PublishError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = message.to_json()?;
            self.send(topic, topic, payload.as_bytes())
                .await
                .map_err(|reason| PublishError::PublishFailed {
                    topic: topic.to_string(),
                    reason,
                })
        })
    }
}

impl ResetQueue for RedpandaProducer {
    fn enqueue<'a>(
        &'a self,
        account_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(async move {
            self.send(&self.reset_topic, account_id, account_id.as_bytes())
                .await
                .map(|_| ())
                .map_err(|reason| QueueError::EnqueueFailed {
                    account_id: account_id.to_string(),
                    reason,
                })
        })
    }
}

/// Builder for a [`RedpandaProducer`].
#[derive(Debug, Default)]
pub struct RedpandaProducerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    reset_topic: Option<String>,
}

impl RedpandaProducerBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// "0", "1" or "all". Default: "all".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// "none", "gzip", "snappy", "lz4" or "zstd". Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Topic for reset requests. Default: [`DEFAULT_RESET_TOPIC`].
    #[must_use]
    pub fn reset_topic(mut self, topic: impl Into<String>) -> Self {
        self.reset_topic = Some(topic.into());
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::ConnectionFailed`] if brokers are not set or
    /// the client cannot be created.
    pub fn build(self) -> Result<RedpandaProducer, RedpandaError> {
        let brokers = self
            .brokers
            .ok_or_else(|| RedpandaError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                RedpandaError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let reset_topic = self
            .reset_topic
            .unwrap_or_else(|| DEFAULT_RESET_TOPIC.to_string());
        tracing::info!(brokers = %brokers, acks, compression, reset_topic = %reset_topic, "Redpanda producer created");

        Ok(RedpandaProducer {
            producer,
            timeout,
            reset_topic,
        })
    }
}

/// Consumer for the change feed and the reset queue.
#[derive(Debug, Clone)]
pub struct RedpandaSubscriber {
    brokers: String,
    consumer_group: String,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaSubscriber {
    /// Builder for a configured subscriber.
    #[must_use]
    pub fn builder() -> RedpandaSubscriberBuilder {
        RedpandaSubscriberBuilder::default()
    }

    /// Consumer group shared by every instance.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Lease change records from `topic`.
    ///
    /// Undecodable records surface as [`RedpandaError::Decode`] items; the
    /// stream continues.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::SubscriptionFailed`] if the consumer cannot
    /// subscribe.
    pub fn change_feed(&self, topic: &str) -> Result<ChangeRecordStream, RedpandaError> {
        let stream = self
            .subscribe(topic)?
            .map(|delivery| delivery.and_then(|bytes| decode_change_record(&bytes)));
        Ok(Box::pin(stream))
    }

    /// Account ids from the reset queue on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::SubscriptionFailed`] if the consumer cannot
    /// subscribe.
    pub fn reset_queue(&self, topic: &str) -> Result<ResetRequestStream, RedpandaError> {
        let stream = self
            .subscribe(topic)?
            .map(|delivery| delivery.and_then(|bytes| decode_reset_request(&bytes)));
        Ok(Box::pin(stream))
    }

    /// Raw payloads from `topic`. Must be called inside a Tokio runtime; the
    /// consumer runs on a spawned task until the stream is dropped.
    ///
    /// Offsets are never committed here. Each [`Delivery`] commits its own
    /// offset once the caller has handled it.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::SubscriptionFailed`] if the consumer cannot
    /// be created or subscribed.
    pub fn subscribe(&self, topic: &str) -> Result<PayloadStream, RedpandaError> {
        let subscription_failed = |reason: String| RedpandaError::SubscriptionFailed {
            topic: topic.to_string(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

        tracing::info!(
            topic,
            consumer_group = %self.consumer_group,
            buffer_size = self.buffer_size,
            auto_offset_reset = %self.auto_offset_reset,
            "Subscribed to topic"
        );

        let consumer = Arc::new(consumer);
        let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
        tokio::spawn(async move {
            let mut stream = consumer.stream();
            while let Some(received) = stream.next().await {
                let delivery = match received {
                    Ok(message) => {
                        let payload = message.payload().map_or_else(
                            || Err(RedpandaError::Decode("Message has no payload".to_string())),
                            |bytes| Ok(bytes.to_vec()),
                        );
                        let offset = ConsumerOffset {
                            consumer: Arc::clone(&consumer),
                            topic: message.topic().to_string(),
                            partition: message.partition(),
                            offset: message.offset(),
                        };
                        Delivery::new(payload, offset)
                    }
                    Err(e) => Delivery::uncommitted(RedpandaError::Transport(format!(
                        "Failed to receive message: {e}"
                    ))),
                };

                if tx.send(delivery).await.is_err() {
                    tracing::debug!("Subscriber dropped, exiting consumer task");
                    break;
                }
            }
            tracing::debug!("Consumer task exiting");
        });

        let stream = async_stream::stream! {
            while let Some(delivery) = rx.recv().await {
                yield delivery;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Builder for a [`RedpandaSubscriber`].
#[derive(Debug, Default)]
pub struct RedpandaSubscriberBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaSubscriberBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group. Default: "lease-pool".
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Messages buffered between the consumer task and the stream. Default: 1000.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts reading. Default: "earliest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`RedpandaError::ConnectionFailed`] if brokers are not set or
    /// the buffer size is zero.
    pub fn build(self) -> Result<RedpandaSubscriber, RedpandaError> {
        let brokers = self
            .brokers
            .ok_or_else(|| RedpandaError::ConnectionFailed("Brokers not configured".to_string()))?;
        let buffer_size = self.buffer_size.unwrap_or(1000);
        if buffer_size == 0 {
            return Err(RedpandaError::ConnectionFailed(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(RedpandaSubscriber {
            brokers,
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| "lease-pool".to_string()),
            buffer_size,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lease_pool_core::change_feed::ChangeEventKind;

    #[test]
    fn producer_and_subscriber_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<RedpandaProducer>();
        assert_send_sync::<RedpandaSubscriber>();
    }

    #[test]
    fn builders_require_brokers() {
        assert!(matches!(
            RedpandaProducer::builder().build(),
            Err(RedpandaError::ConnectionFailed(_))
        ));
        assert!(matches!(
            RedpandaSubscriber::builder().build(),
            Err(RedpandaError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn subscriber_rejects_empty_buffer() {
        let result = RedpandaSubscriber::builder()
            .brokers("localhost:9092")
            .buffer_size(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn subscriber_defaults() {
        let subscriber = RedpandaSubscriber::builder()
            .brokers("localhost:9092")
            .build()
            .unwrap();
        assert_eq!(subscriber.consumer_group(), "lease-pool");
    }

    #[test]
    fn producer_defaults_reset_topic() {
        let producer = RedpandaProducer::new("localhost:9092").unwrap();
        assert_eq!(producer.reset_topic(), DEFAULT_RESET_TOPIC);
    }

    #[derive(Clone, Default)]
    struct CountingCommit(Arc<std::sync::atomic::AtomicUsize>);

    impl OffsetCommit for CountingCommit {
        fn commit(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl CountingCommit {
        fn count(&self) -> usize {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[test]
    fn decoding_keeps_the_commit_handle() {
        let commits = CountingCommit::default();
        let delivery = Delivery::new(Ok(b"not json".to_vec()), commits.clone())
            .and_then(|bytes| decode_change_record(&bytes));

        assert!(matches!(delivery.message(), Err(RedpandaError::Decode(_))));
        delivery.commit();
        assert_eq!(commits.count(), 1);
    }

    #[test]
    fn dropped_delivery_is_not_committed() {
        let commits = CountingCommit::default();
        let delivery = Delivery::new(Ok("123456789012".to_string()), commits.clone());

        drop(delivery);

        assert_eq!(commits.count(), 0);
        Delivery::<String>::uncommitted(RedpandaError::Transport("down".to_string())).commit();
        assert_eq!(commits.count(), 0);
    }

    #[test]
    fn message_id_is_partition_and_offset() {
        assert_eq!(message_id(3, 42), "3:42");
    }

    #[test]
    fn reset_request_is_trimmed_account_id() {
        assert_eq!(decode_reset_request(b" 123456789012\n").unwrap(), "123456789012");
        assert!(decode_reset_request(b"  ").is_err());
        assert!(decode_reset_request(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn change_record_payload_decodes() {
        let payload = serde_json::json!({
            "eventKind": "REMOVE",
            "before": {"AccountId": {"S": "1"}}
        })
        .to_string();

        let record = decode_change_record(payload.as_bytes()).unwrap();

        assert_eq!(record.event_kind, ChangeEventKind::Remove);
        assert!(record.after.is_empty());
        assert!(matches!(
            decode_change_record(b"not json"),
            Err(RedpandaError::Decode(_))
        ));
    }
}
