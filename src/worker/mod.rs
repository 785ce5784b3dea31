use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{IngestEntry, MessageBus};
use crate::models::{Message, MessageStatus};
use crate::presence::PresenceStore;
use crate::repository::MessageRepository;
use crate::websocket::events::ServerFrame;

/// How long `read_one` blocks on an empty queue before looping back to
/// check the shutdown signal. Purely a shutdown responsiveness knob, not
/// configurable.
const POLL_BLOCK_MS: usize = 5_000;

/// Delivery Worker: consumes the durable ingest queue one message at a time
/// (`prefetch=1`, manual ack), resolves recipient presence, publishes to
/// the per-user fan-out channel, and persists the terminal status, always
/// before acking.
#[derive(Clone)]
pub struct DeliveryWorker {
    bus: MessageBus,
    presence: PresenceStore,
    repository: MessageRepository,
    consumer_name: String,
    msg_deadline: Duration,
    notify_debounce: Duration,
    last_notified: std::sync::Arc<Mutex<HashMap<String, Instant>>>,
}

impl DeliveryWorker {
    pub fn new(
        bus: MessageBus,
        presence: PresenceStore,
        repository: MessageRepository,
        consumer_name: impl Into<String>,
        msg_deadline: Duration,
        notify_debounce: Duration,
    ) -> Self {
        DeliveryWorker {
            bus,
            presence,
            repository,
            consumer_name: consumer_name.into(),
            msg_deadline,
            notify_debounce,
            last_notified: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run until `shutdown` is cancelled, then return, the caller is
    /// expected to have already stopped accepting new gateway sessions so
    /// no new ingest traffic arrives while this drains in-flight messages.
    ///
    /// A `reclaim_ticker`, firing every `MSG_DEADLINE`, pairs with the queue
    /// read: an entry another worker (or a prior run of this one) gave up on
    /// after its own `MSG_DEADLINE` timeout sits unacked in the consumer
    /// group's PEL until something calls `XAUTOCLAIM`; this loop is that
    /// something, so "leaving unacked for reclaim" is actually true.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut reclaim_ticker = tokio::time::interval(self.msg_deadline);
        reclaim_ticker.tick().await; // first tick is immediate; nothing to reclaim yet

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = reclaim_ticker.tick() => {
                    self.reclaim_stale_entries().await;
                }
                result = self.bus.read_one(&self.consumer_name, POLL_BLOCK_MS) => {
                    match result {
                        Ok(Some(entry)) => self.process_with_deadline(&entry).await,
                        Ok(None) => {} // block timeout elapsed, nothing queued
                        Err(e) => {
                            tracing::error!(error = ?e, "Ingest queue read failed; backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    /// Run `process` under the `MSG_DEADLINE` budget, logging and letting
    /// the entry sit unacked (for `reclaim_stale_entries` to pick up) on
    /// both processing failure and deadline expiry.
    async fn process_with_deadline(&self, entry: &IngestEntry) {
        match tokio::time::timeout(self.msg_deadline, self.process(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(stream_id = %entry.stream_id, error = ?e, "Message processing failed");
            }
            Err(_) => {
                tracing::warn!(
                    stream_id = %entry.stream_id,
                    "Message processing exceeded MSG_DEADLINE; leaving unacked for reclaim"
                );
            }
        }
    }

    /// Claim ingest entries idle for longer than `MSG_DEADLINE` via
    /// `XAUTOCLAIM` and redrive each through the same deadline-bounded
    /// processing path a freshly-read entry gets. Idempotent: a claimed
    /// entry that was in fact already persisted and acked by whoever held
    /// it before is just reprocessed against the repository's idempotent
    /// upsert.
    async fn reclaim_stale_entries(&self) {
        let min_idle_ms = self.msg_deadline.as_millis() as usize;
        match self.bus.reclaim_stale(&self.consumer_name, min_idle_ms).await {
            Ok(entries) => {
                for entry in &entries {
                    tracing::info!(stream_id = %entry.stream_id, "Reclaimed stale ingest entry");
                    self.process_with_deadline(entry).await;
                }
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to reclaim stale ingest entries");
            }
        }
    }

    /// Process a single ingest entry end to end: parse, upsert, resolve
    /// presence, publish, persist terminal status, ack. Returns `Err` only
    /// for failures that should leave the entry unacked (repository
    /// failure on the terminal write); every other branch acks before
    /// returning `Ok`.
    async fn process(&self, entry: &IngestEntry) -> crate::error::AppResult<()> {
        let incoming = match entry.parse() {
            Ok(message) => message,
            Err(e) => {
                // Poison pill: no retry helps an unparseable payload (spec §7).
                tracing::warn!(stream_id = %entry.stream_id, error = ?e, "Dropping malformed ingest entry");
                self.bus.ack(&entry.stream_id).await?;
                return Ok(());
            }
        };

        let existing = self
            .repository
            .get_by_message_id(incoming.message_id)
            .await?;
        let is_replay = matches!(
            existing.as_ref().map(|m| m.status),
            Some(MessageStatus::Undelivered)
        );

        let provisional_status = if is_replay {
            MessageStatus::Undelivered
        } else {
            MessageStatus::Sent
        };

        let mut record = Message {
            message_id: incoming.message_id,
            sender_id: incoming.sender_id,
            recipient_id: incoming.recipient_id,
            content: incoming.content,
            status: provisional_status,
            created_at: incoming.created_at,
            updated_at: incoming.updated_at,
        };
        // `upsert` itself preserves `created_at` from any existing row; the
        // value carried on `record` only matters for a genuinely first
        // insert.
        record = self.repository.upsert(&record).await?;

        let recipient = record.recipient_id.clone();
        let message_id = record.message_id;

        if !self.presence.is_online(&recipient).await {
            self.finish_undelivered(record, &entry.stream_id).await?;
            return Ok(());
        }

        let payload = serde_json::to_string(&record)
            .map_err(|e| crate::error::AppError::Bus(e.to_string()))?;
        let subscribers = match self.bus.publish_to_user(&recipient, &payload).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = ?e, "Fan-out publish failed");
                0
            }
        };

        if subscribers < 1 {
            self.finish_undelivered(record, &entry.stream_id).await?;
            return Ok(());
        }

        record.status = MessageStatus::Delivered;
        self.repository.upsert(&record).await?;
        self.bus.ack(&entry.stream_id).await?;

        if is_replay {
            self.maybe_notify_inbox(&recipient).await;
        }

        Ok(())
    }

    async fn finish_undelivered(
        &self,
        mut record: Message,
        stream_id: &str,
    ) -> crate::error::AppResult<()> {
        record.status = MessageStatus::Undelivered;
        // Critical ordering (spec §4.3): persist before ack. If this upsert
        // fails the entry is left unacked (propagated via `?`) and will be
        // redelivered by the consumer group.
        self.repository.upsert(&record).await?;
        self.bus.ack(stream_id).await?;
        Ok(())
    }

    /// Send a debounced `{type:"notification", subType:"inbox", ...}` to
    /// `recipient_id` after a replay-driven DELIVERED transition (spec §4.4,
    /// first emission point). At most one per `NOTIFY_DEBOUNCE` window per
    /// recipient; the debounce map is a short-held mutex per spec §5.
    async fn maybe_notify_inbox(&self, recipient_id: &str) {
        let now = Instant::now();
        {
            let mut last = self.last_notified.lock().await;
            if let Some(sent_at) = last.get(recipient_id) {
                if now.duration_since(*sent_at) < self.notify_debounce {
                    return;
                }
            }
            last.insert(recipient_id.to_string(), now);
        }

        let count = match self
            .repository
            .count_distinct_senders_undelivered(recipient_id)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(recipient_id, error = ?e, "Failed to compute undelivered count for notification");
                return;
            }
        };

        let frame = ServerFrame::inbox_notification(recipient_id, count).to_json();
        if let Err(e) = self.bus.publish_to_user(recipient_id, &frame).await {
            tracing::warn!(recipient_id, error = ?e, "Failed to publish inbox notification");
        }
    }
}
