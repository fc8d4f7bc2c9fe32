//! Post-commit data-change publication.
//!
//! Messages are enqueued after the governing transaction commits and drained
//! by a dedicated task, so a slow or failing sink never blocks or rolls back
//! a state transition. Delivery is best-effort and at-least-once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod topics {
    pub const MEAL_PLANS: &str = "meal_plans";
    pub const MEAL_PLAN_OPTIONS: &str = "meal_plan_options";
    pub const MEAL_PLAN_OPTION_VOTES: &str = "meal_plan_option_votes";
    pub const MEAL_PLAN_TASKS: &str = "meal_plan_tasks";
    pub const ALERTS: &str = "alerts";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MealPlanCreated,
    MealPlanOptionVoteCreated,
    MealPlanOptionFinalized,
    MealPlanFinalized,
    MealPlanFinalizationFailed,
    MealPlanFinalizationReplayed,
    MealPlanTaskCreated,
    MealPlanTasksMaterialized,
    MealPlanTaskStatusChanged,
    WorkerRetriesExhausted,
    RecipeGraphInvalid,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MealPlanCreated => "meal_plan_created",
            Self::MealPlanOptionVoteCreated => "meal_plan_option_vote_created",
            Self::MealPlanOptionFinalized => "meal_plan_option_finalized",
            Self::MealPlanFinalized => "meal_plan_finalized",
            Self::MealPlanFinalizationFailed => "meal_plan_finalization_failed",
            Self::MealPlanFinalizationReplayed => "meal_plan_finalization_replayed",
            Self::MealPlanTaskCreated => "meal_plan_task_created",
            Self::MealPlanTasksMaterialized => "meal_plan_tasks_materialized",
            Self::MealPlanTaskStatusChanged => "meal_plan_task_status_changed",
            Self::WorkerRetriesExhausted => "worker_retries_exhausted",
            Self::RecipeGraphInvalid => "recipe_graph_invalid",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON body of every published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeMessage {
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub household_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl DataChangeMessage {
    pub fn new(
        event_type: EventType,
        entity_type: &str,
        entity_id: Uuid,
        household_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            entity_type: entity_type.to_owned(),
            entity_id,
            household_id,
            timestamp,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A sink for data-change messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &DataChangeMessage) -> anyhow::Result<()>;
}

/// Writes each message as a structured log line.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, message: &DataChangeMessage) -> anyhow::Result<()> {
        tracing::info!(
            topic,
            event_type = %message.event_type,
            entity_type = %message.entity_type,
            entity_id = %message.entity_id,
            household_id = %message.household_id,
            "data change"
        );
        Ok(())
    }
}

/// Sends each message through `pg_notify` on one channel; the payload wraps
/// the message with its topic.
#[derive(Debug, Clone)]
pub struct PgNotifyPublisher {
    pool: PgPool,
    channel: String,
}

impl PgNotifyPublisher {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Publisher for PgNotifyPublisher {
    async fn publish(&self, topic: &str, message: &DataChangeMessage) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "topic": topic, "message": message }).to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("failed to send pg_notify")?;
        Ok(())
    }
}

/// Keeps every message in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, DataChangeMessage)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, DataChangeMessage)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<DataChangeMessage> {
        self.messages()
            .into_iter()
            .filter(|(_, m)| m.event_type == event_type)
            .map(|(_, m)| m)
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, message: &DataChangeMessage) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_owned(), message.clone()));
        Ok(())
    }
}

enum Command {
    Publish(String, DataChangeMessage),
    Flush(oneshot::Sender<()>),
}

/// Bounded in-memory queue in front of a [`Publisher`], drained by one
/// background task.
pub struct BufferedPublisher {
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl BufferedPublisher {
    /// Start the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn Publisher>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Publish(topic, message) => {
                        if let Err(e) = sink.publish(&topic, &message).await {
                            tracing::warn!(
                                topic = %topic,
                                event_type = %message.event_type,
                                entity_id = %message.entity_id,
                                error = %e,
                                "failed to publish data change"
                            );
                        }
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            dropped: AtomicU64::new(0),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Command>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Queue a message without waiting. Messages are dropped with a warning
    /// when the buffer is full or the publisher is shut down.
    pub fn enqueue(&self, topic: &str, message: DataChangeMessage) {
        let Some(tx) = self.sender() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic, event_type = %message.event_type, "publisher shut down, dropping message");
            return;
        };
        if let Err(e) = tx.try_send(Command::Publish(topic.to_owned(), message)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic, error = %e, "publisher buffer full, dropping message");
        }
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until everything enqueued before this call has been handed to
    /// the sink.
    pub async fn flush(&self) {
        let Some(tx) = self.sender() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Command::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop accepting messages and drain the queue, giving up after
    /// `timeout`. Returns `false` when the drain timed out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "publisher drain timed out, remaining messages lost"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(event_type: EventType) -> DataChangeMessage {
        DataChangeMessage::new(
            event_type,
            "meal_plan",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Utc::now(),
        )
    }

    #[test]
    fn message_serializes_with_snake_case_event_type() {
        let msg = message(EventType::MealPlanFinalized);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event_type"], "meal_plan_finalized");
        assert_eq!(json["entity_type"], "meal_plan");
        assert!(json.get("metadata").is_none());

        let with = msg.with_metadata(serde_json::json!({ "tie": true }));
        let json = serde_json::to_value(&with).unwrap();
        assert_eq!(json["metadata"]["tie"], true);
    }

    #[test]
    fn as_str_matches_serde_name() {
        for t in [
            EventType::MealPlanOptionVoteCreated,
            EventType::MealPlanTasksMaterialized,
            EventType::WorkerRetriesExhausted,
        ] {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, t.as_str());
        }
    }

    #[tokio::test]
    async fn buffered_publisher_delivers_in_order() {
        let sink = Arc::new(RecordingPublisher::new());
        let publisher = BufferedPublisher::spawn(sink.clone(), 16);
        publisher.enqueue(topics::MEAL_PLANS, message(EventType::MealPlanCreated));
        publisher.enqueue(topics::MEAL_PLANS, message(EventType::MealPlanFinalized));
        publisher.flush().await;

        let events: Vec<_> = sink.messages().into_iter().map(|(_, m)| m.event_type).collect();
        assert_eq!(
            events,
            vec![EventType::MealPlanCreated, EventType::MealPlanFinalized]
        );
        assert!(publisher.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_dropped() {
        let sink = Arc::new(RecordingPublisher::new());
        let publisher = BufferedPublisher::spawn(sink.clone(), 4);
        assert!(publisher.shutdown(Duration::from_secs(1)).await);
        publisher.enqueue(topics::ALERTS, message(EventType::WorkerRetriesExhausted));
        publisher.flush().await;
        assert_eq!(publisher.dropped(), 1);
        assert!(sink.messages().is_empty());
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _: &str, _: &DataChangeMessage) -> anyhow::Result<()> {
            anyhow::bail!("broker down")
        }
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_drain() {
        let publisher = BufferedPublisher::spawn(Arc::new(FailingPublisher), 4);
        publisher.enqueue(topics::MEAL_PLANS, message(EventType::MealPlanCreated));
        publisher.flush().await;
        assert!(publisher.shutdown(Duration::from_secs(1)).await);
    }
}
