//! Cache/Coordinator adapter: key/value with TTL, counters, sets, the
//! distributed lock primitive, and the pub/sub bus.
//!
//! Commands go through a multiplexed connection manager; subscriptions use
//! a dedicated connection so a slow publish cannot block delivery.

use {
    anyhow::Result,
    futures::StreamExt,
    redis::{
        aio::{
            ConnectionManager,
            PubSubSink,
            PubSubStream,
        },
        AsyncCommands,
        Script,
    },
    serde::{
        de::DeserializeOwned,
        Serialize,
    },
    tokio::sync::mpsc,
};

// Only the holder may release: compare the stored value before deleting.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct Cache {
    client:  redis::Client,
    manager: ConnectionManager,
}

impl Cache {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    /// Remaining TTL in seconds; `None` when the key is absent or has no
    /// expiry.
    pub async fn ttl_secs(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.manager.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(u64::try_from(ttl).ok())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json_ex<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        self.set_ex(key, &serde_json::to_string(value)?, ttl_secs).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.incr(key, 1).await?)
    }

    pub async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.decr(key, 1).await?)
    }

    /// Increment a windowed counter, setting the window expiry on first use.
    pub async fn incr_windowed(&self, key: &str, window_secs: i64) -> Result<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            conn.expire::<_, ()>(key, window_secs).await?;
        }
        Ok(count)
    }

    pub async fn set_add(&self, key: &str, member: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        conn.expire::<_, ()>(key, ttl_secs).await?;
        Ok(())
    }

    // Redis drops empty sets on its own; no explicit cleanup needed.
    pub async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn set_cardinality(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.scard(key).await?;
        Ok(count.max(0) as u64)
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.smembers(key).await?)
    }

    /// Conditional set-if-absent with a millisecond TTL; the value encodes
    /// the holder. Returns whether the lock was acquired.
    pub async fn try_acquire_lock(&self, key: &str, holder: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    /// Release a lock held by `holder`. Returns false when the lock had
    /// already expired or was taken over.
    pub async fn release_lock(&self, key: &str, holder: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let released: i64 = Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        self.publish(channel, &serde_json::to_string(payload)?).await
    }

    /// Open the per-instance subscriber connection. The returned handle
    /// changes the channel set; the message stream is drained by a single
    /// demultiplexing dispatch loop.
    pub async fn open_subscriber(&self) -> Result<(PubSubHandle, PubSubMessages)> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();
        Ok((PubSubHandle::spawn(sink), PubSubMessages { stream }))
    }
}

enum SubscriberCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Handle to the subscriber connection's channel set. Commands are applied
/// by a background task that owns the sink half of the connection.
#[derive(Clone)]
pub struct PubSubHandle {
    tx: mpsc::UnboundedSender<SubscriberCommand>,
}

impl PubSubHandle {
    fn spawn(mut sink: PubSubSink) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = match command {
                    SubscriberCommand::Subscribe(channel) => sink.subscribe(&channel).await,
                    SubscriberCommand::Unsubscribe(channel) => sink.unsubscribe(&channel).await,
                };
                if let Err(err) = result {
                    tracing::warn!(error = ?err, "Pub/sub subscription command failed.");
                }
            }
        });
        Self { tx }
    }

    pub fn subscribe(&self, channel: String) {
        let _ = self.tx.send(SubscriberCommand::Subscribe(channel));
    }

    pub fn unsubscribe(&self, channel: String) {
        let _ = self.tx.send(SubscriberCommand::Unsubscribe(channel));
    }
}

pub struct PubSubMessages {
    stream: PubSubStream,
}

impl PubSubMessages {
    /// Next (channel, payload) pair; `None` when the connection is gone and
    /// the caller should reconnect.
    pub async fn next(&mut self) -> Option<(String, String)> {
        loop {
            let msg = self.stream.next().await?;
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => return Some((channel, payload)),
                Err(err) => {
                    tracing::warn!(channel, error = ?err, "Dropping undecodable bus payload.");
                }
            }
        }
    }
}

pub fn lock_key(auction_id: crate::models::AuctionId) -> String {
    format!("lock:auction:{}", auction_id)
}

pub fn top_bid_key(auction_id: crate::models::AuctionId) -> String {
    format!("auction:{}:top", auction_id)
}

pub fn auction_snapshot_key(auction_id: crate::models::AuctionId) -> String {
    format!("auction:{}:snapshot", auction_id)
}

/// Map an infrastructure error to a log-and-continue default. Used by the
/// admission path, which fails open when the rate fabric is degraded.
pub fn fail_open<T>(result: Result<T>, default: T, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = ?err, context, "Cache unavailable, failing open.");
            default
        }
    }
}
