use redis::aio::{ConnectionManager, PubSub};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};

use crate::error::{AppError, AppResult};
use crate::models::Message;

const INGEST_STREAM: &str = "chat:ingest";
const INGEST_GROUP: &str = "delivery-workers";

fn user_channel(user_id: &str) -> String {
    format!("user:{user_id}:messages")
}

/// A raw entry popped off the durable ingest queue, paired with the stream
/// entry id needed to ack or reclaim it. The payload is handed back
/// unparsed: whether a malformed payload is a poison pill to ack-drop or a
/// reason to nack is a worker policy decision, not the bus's.
#[derive(Debug, Clone)]
pub struct IngestEntry {
    pub stream_id: String,
    pub payload: String,
}

impl IngestEntry {
    pub fn parse(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// The message bus: a durable ingest queue (Redis Streams, consumer groups,
/// manual ack) plus a per-user fan-out pub/sub channel. Both halves share
/// one Redis connection manager, the same store backing presence, since
/// this system's wire contract ("Publish returns the number of
/// subscribers", colon-namespaced keys) is Redis vocabulary end to end.
#[derive(Clone)]
pub struct MessageBus {
    conn: ConnectionManager,
    client: redis::Client,
}

impl MessageBus {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url).map_err(AppError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(AppError::from)?;

        let bus = MessageBus { conn, client };
        bus.ensure_group().await?;
        Ok(bus)
    }

    /// Create the consumer group on the ingest stream if it doesn't exist
    /// yet, creating the stream itself (`MKSTREAM`) on first boot. A
    /// `BUSYGROUP` error means the group already exists from a prior run ,
    /// that's the expected steady-state case, not a failure.
    async fn ensure_group(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = conn
            .xgroup_create_mkstream(INGEST_STREAM, INGEST_GROUP, "$")
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(AppError::from(e)),
        }
    }

    /// Enqueue a message onto the durable ingest queue. Called by the
    /// control API handler when a message is first submitted, and by the
    /// replay coordinator when re-publishing undelivered messages.
    pub async fn enqueue(&self, message: &Message) -> AppResult<String> {
        let payload = serde_json::to_string(message).map_err(|e| AppError::Bus(e.to_string()))?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(INGEST_STREAM, "*", &[("payload", payload.as_str())])
            .await
            .map_err(AppError::from)?;
        Ok(id)
    }

    /// Pop up to one message from the ingest queue for this consumer,
    /// blocking up to `block_ms` if the stream is empty. `prefetch=1` is
    /// enforced by always requesting `COUNT 1`.
    pub async fn read_one(
        &self,
        consumer_name: &str,
        block_ms: usize,
    ) -> AppResult<Option<IngestEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(INGEST_GROUP, consumer_name)
            .count(1)
            .block(block_ms);

        let reply: StreamReadReply = conn
            .xread_options(&[INGEST_STREAM], &[">"], &opts)
            .await
            .map_err(AppError::from)?;

        for stream_key in reply.keys {
            for stream_id in stream_key.ids {
                let payload: String = match stream_id.map.get("payload") {
                    Some(redis::Value::Data(bytes)) => {
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    _ => continue,
                };
                return Ok(Some(IngestEntry {
                    stream_id: stream_id.id,
                    payload,
                }));
            }
        }

        Ok(None)
    }

    /// Acknowledge successful processing of a stream entry. Must only be
    /// called after the message's final status has been persisted, acking
    /// first and crashing before persistence would lose the message.
    pub async fn ack(&self, stream_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(INGEST_STREAM, INGEST_GROUP, &[stream_id])
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    /// Reclaim entries that have sat unacked for longer than `min_idle_ms`
    /// (e.g. a worker crashed after reading but before acking). Redis
    /// Streams has no NACK; "give up and let someone else try" is expressed
    /// as XAUTOCLAIM with a minimum idle time, handing the entry to
    /// `consumer_name`.
    pub async fn reclaim_stale(
        &self,
        consumer_name: &str,
        min_idle_ms: usize,
    ) -> AppResult<Vec<IngestEntry>> {
        let mut conn = self.conn.clone();
        let (_cursor, claimed, _deleted): (String, Vec<redis::streams::StreamId>, Vec<String>) =
            conn.xautoclaim(
                INGEST_STREAM,
                INGEST_GROUP,
                consumer_name,
                min_idle_ms,
                "0-0",
            )
            .await
            .map_err(AppError::from)?;

        let mut entries = Vec::with_capacity(claimed.len());
        for stream_id in claimed {
            let payload: String = match stream_id.map.get("payload") {
                Some(redis::Value::Data(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
                _ => continue,
            };
            entries.push(IngestEntry {
                stream_id: stream_id.id,
                payload,
            });
        }
        Ok(entries)
    }

    /// Publish a chat payload to a user's per-connection fan-out channel.
    /// Returns the number of active subscribers at publish time, the
    /// gateway uses this to decide, without a separate presence check,
    /// whether delivery actually reached a live session.
    pub async fn publish_to_user(&self, user_id: &str, payload: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .publish(user_channel(user_id), payload)
            .await
            .map_err(AppError::from)?;
        Ok(count)
    }

    /// Subscribe to a user's fan-out channel. The returned `PubSub` has
    /// already had its `SUBSCRIBE` acknowledged by the server by the time
    /// this call returns, satisfying the "subscription confirmed before the
    /// caller proceeds" ordering the gateway session relies on.
    pub async fn subscribe_user(&self, user_id: &str) -> AppResult<PubSub> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(AppError::from)?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(user_channel(user_id))
            .await
            .map_err(AppError::from)?;
        Ok(pubsub)
    }
}
