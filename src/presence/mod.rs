use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::AppResult;

fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

/// TTL-backed presence tracking, backed by Redis. A user is "online" exactly
/// as long as their `presence:<id>` key has not expired; there is no
/// separate "go offline" signal other than the key lapsing or being deleted
/// explicitly on clean teardown.
#[derive(Clone)]
pub struct PresenceStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl PresenceStore {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> AppResult<Self> {
        let client = redis::Client::open(redis_url).map_err(crate::error::AppError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(crate::error::AppError::from)?;
        Ok(PresenceStore { conn, ttl_secs })
    }

    /// `SET presence:<id> ONLINE EX <PRESENCE_TTL>`, marks the user online
    /// and (re)starts the TTL countdown. Called on connect and by the
    /// session's presence-refresh ticker.
    pub async fn mark_online(&self, user_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(presence_key(user_id), "ONLINE", self.ttl_secs)
            .await
            .map_err(crate::error::AppError::from)?;
        Ok(())
    }

    /// `GET presence:<id>`. Both "key absent" and a connection error are
    /// treated as offline, a presence read failure must never be mistaken
    /// for "online", since that would cause a message to be misrouted to a
    /// dead session instead of persisted as undelivered.
    pub async fn is_online(&self, user_id: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(presence_key(user_id)).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(user_id, error = ?e, "Presence read failed; treating as offline");
                false
            }
        }
    }

    /// `DEL presence:<id>`, called on clean session teardown so the user is
    /// immediately offline rather than waiting out the remaining TTL.
    pub async fn clear(&self, user_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(presence_key(user_id))
            .await
            .map_err(crate::error::AppError::from)?;
        Ok(())
    }
}
