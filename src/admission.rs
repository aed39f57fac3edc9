//! Admission control for the gateway: concurrent-connection caps per client
//! address and per identity, TTL'd block flags for offenders, and the
//! windowed bid-frequency and global throttle counters.
//!
//! All state lives in the cache so every instance sees the same counts. If
//! the cache is unavailable admission fails open: bidding availability is
//! prioritized over strict admission, the durable pipeline remains the
//! safety net.

use {
    crate::{
        cache::{
            fail_open,
            Cache,
        },
        models::UserId,
    },
    clap::Args,
    serde::{
        Deserialize,
        Serialize,
    },
    std::net::IpAddr,
    time::OffsetDateTime,
    uuid::Uuid,
};

const DEFAULT_MAX_PER_ADDRESS: &str = "5";
const DEFAULT_MAX_PER_IDENTITY: &str = "3";
const DEFAULT_TRACKING_WINDOW_SECS: &str = "60";
const DEFAULT_BLOCK_DURATION_SECS: &str = "300";
const DEFAULT_BID_RATE_LIMIT: &str = "10";
const DEFAULT_BID_RATE_WINDOW_SECS: &str = "60";
const DEFAULT_GLOBAL_THROTTLE_LIMIT: &str = "100";
const DEFAULT_GLOBAL_THROTTLE_WINDOW_SECS: &str = "60";

// Safety net for descriptors orphaned by a crashed instance.
const DESCRIPTOR_TTL_SECS: u64 = 86_400;

#[derive(Args, Clone, Debug)]
#[command(next_help_heading = "Admission Options")]
#[group(id = "Admission")]
pub struct Options {
    /// Maximum concurrent connections per client address.
    #[arg(long = "admission-max-per-address")]
    #[arg(default_value = DEFAULT_MAX_PER_ADDRESS)]
    #[arg(env = "ADMISSION_MAX_PER_ADDRESS")]
    pub max_connections_per_address:  u64,
    /// Maximum concurrent connections per authenticated identity.
    #[arg(long = "admission-max-per-identity")]
    #[arg(default_value = DEFAULT_MAX_PER_IDENTITY)]
    #[arg(env = "ADMISSION_MAX_PER_IDENTITY")]
    pub max_connections_per_identity: u64,
    /// Tracking window for the connection sets, in seconds.
    #[arg(long = "admission-tracking-window-secs")]
    #[arg(default_value = DEFAULT_TRACKING_WINDOW_SECS)]
    #[arg(env = "ADMISSION_TRACKING_WINDOW_SECS")]
    pub tracking_window_secs:         i64,
    /// How long offenders stay blocked, in seconds.
    #[arg(long = "admission-block-duration-secs")]
    #[arg(default_value = DEFAULT_BLOCK_DURATION_SECS)]
    #[arg(env = "ADMISSION_BLOCK_DURATION_SECS")]
    pub block_duration_secs:          u64,
    /// Maximum bids per identity per window.
    #[arg(long = "bid-rate-limit")]
    #[arg(default_value = DEFAULT_BID_RATE_LIMIT)]
    #[arg(env = "BID_RATE_LIMIT")]
    pub bid_rate_limit:               i64,
    #[arg(long = "bid-rate-window-secs")]
    #[arg(default_value = DEFAULT_BID_RATE_WINDOW_SECS)]
    #[arg(env = "BID_RATE_WINDOW_SECS")]
    pub bid_rate_window_secs:         i64,
    /// Global throttle on the HTTP fallback path.
    #[arg(long = "global-throttle-limit")]
    #[arg(default_value = DEFAULT_GLOBAL_THROTTLE_LIMIT)]
    #[arg(env = "GLOBAL_THROTTLE_LIMIT")]
    pub global_throttle_limit:        i64,
    #[arg(long = "global-throttle-window-secs")]
    #[arg(default_value = DEFAULT_GLOBAL_THROTTLE_WINDOW_SECS)]
    #[arg(env = "GLOBAL_THROTTLE_WINDOW_SECS")]
    pub global_throttle_window_secs:  i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed:          bool,
    pub reason:           Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed:          true,
            reason:           None,
            retry_after_secs: None,
        }
    }

    fn deny(reason: &str, retry_after_secs: Option<u64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketDescriptor {
    pub address:      IpAddr,
    pub user_id:      Option<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStats {
    /// Connection counts from the integer fast-path counters; admission
    /// decisions read the authoritative socket-set cardinality instead.
    pub address_connections:  u64,
    pub identity_connections: u64,
    pub address_blocked:      bool,
    pub identity_blocked:     bool,
    /// Socket ids currently tracked for the address.
    pub address_sockets:      Vec<String>,
}

fn block_address_key(address: IpAddr) -> String {
    format!("admission:block:addr:{}", address)
}

fn block_identity_key(user_id: UserId) -> String {
    format!("admission:block:user:{}", user_id)
}

fn connections_address_key(address: IpAddr) -> String {
    format!("admission:conn:addr:{}", address)
}

fn connections_identity_key(user_id: UserId) -> String {
    format!("admission:conn:user:{}", user_id)
}

fn descriptor_key(socket_id: Uuid) -> String {
    format!("admission:socket:{}", socket_id)
}

fn count_address_key(address: IpAddr) -> String {
    format!("admission:count:addr:{}", address)
}

fn count_identity_key(user_id: UserId) -> String {
    format!("admission:count:user:{}", user_id)
}

#[derive(Clone)]
pub struct AdmissionController {
    cache:   Cache,
    options: Options,
}

impl AdmissionController {
    pub fn new(cache: Cache, options: Options) -> Self {
        Self { cache, options }
    }

    /// Admission decision for an incoming connection. Called once with the
    /// address only, before authentication, and again with the resolved
    /// identity.
    pub async fn check(&self, address: IpAddr, identity: Option<UserId>) -> Decision {
        fail_open(
            self.check_inner(address, identity).await,
            Decision::allow(),
            "admission check",
        )
    }

    async fn check_inner(
        &self,
        address: IpAddr,
        identity: Option<UserId>,
    ) -> anyhow::Result<Decision> {
        let address_block = block_address_key(address);
        if self.cache.exists(&address_block).await? {
            let retry = self.cache.ttl_secs(&address_block).await?;
            return Ok(Decision::deny("address temporarily blocked", retry));
        }
        if let Some(user_id) = identity {
            let identity_block = block_identity_key(user_id);
            if self.cache.exists(&identity_block).await? {
                let retry = self.cache.ttl_secs(&identity_block).await?;
                return Ok(Decision::deny("account temporarily blocked", retry));
            }
        }

        let address_connections = self
            .cache
            .set_cardinality(&connections_address_key(address))
            .await?;
        if address_connections >= self.options.max_connections_per_address {
            self.cache
                .set_ex(
                    &address_block,
                    "connection limit exceeded",
                    self.options.block_duration_secs,
                )
                .await?;
            tracing::warn!(%address, "Blocking address over connection cap.");
            return Ok(Decision::deny(
                "too many connections from this address",
                Some(self.options.block_duration_secs),
            ));
        }

        if let Some(user_id) = identity {
            let identity_connections = self
                .cache
                .set_cardinality(&connections_identity_key(user_id))
                .await?;
            if identity_connections >= self.options.max_connections_per_identity {
                self.cache
                    .set_ex(
                        &block_identity_key(user_id),
                        "connection limit exceeded",
                        self.options.block_duration_secs,
                    )
                    .await?;
                tracing::warn!(%user_id, "Blocking identity over connection cap.");
                return Ok(Decision::deny(
                    "too many connections for this account",
                    Some(self.options.block_duration_secs),
                ));
            }
        }

        Ok(Decision::allow())
    }

    /// Record an admitted socket. Best-effort: tracking failures are logged,
    /// never surfaced to the connection.
    pub async fn track(&self, address: IpAddr, socket_id: Uuid, identity: Option<UserId>) {
        let result = self.track_inner(address, socket_id, identity).await;
        fail_open(result, (), "admission track");
    }

    async fn track_inner(
        &self,
        address: IpAddr,
        socket_id: Uuid,
        identity: Option<UserId>,
    ) -> anyhow::Result<()> {
        let member = socket_id.to_string();
        let window = self.options.tracking_window_secs;
        self.cache
            .set_add(&connections_address_key(address), &member, window)
            .await?;
        self.cache.incr(&count_address_key(address)).await?;
        if let Some(user_id) = identity {
            self.cache
                .set_add(&connections_identity_key(user_id), &member, window)
                .await?;
            self.cache.incr(&count_identity_key(user_id)).await?;
        }
        let descriptor = SocketDescriptor {
            address,
            user_id: identity,
            connected_at: OffsetDateTime::now_utc(),
        };
        self.cache
            .set_json_ex(&descriptor_key(socket_id), &descriptor, DESCRIPTOR_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Reverse exactly what `track` recorded for this socket.
    pub async fn untrack(&self, socket_id: Uuid) {
        let result = self.untrack_inner(socket_id).await;
        fail_open(result, (), "admission untrack");
    }

    async fn untrack_inner(&self, socket_id: Uuid) -> anyhow::Result<()> {
        let key = descriptor_key(socket_id);
        let Some(descriptor) = self.cache.get_json::<SocketDescriptor>(&key).await? else {
            return Ok(());
        };
        let member = socket_id.to_string();
        self.cache
            .set_remove(&connections_address_key(descriptor.address), &member)
            .await?;
        self.cache.decr(&count_address_key(descriptor.address)).await?;
        if let Some(user_id) = descriptor.user_id {
            self.cache
                .set_remove(&connections_identity_key(user_id), &member)
                .await?;
            self.cache.decr(&count_identity_key(user_id)).await?;
        }
        self.cache.delete(&key).await?;
        Ok(())
    }

    pub async fn stats(
        &self,
        address: IpAddr,
        identity: Option<UserId>,
    ) -> anyhow::Result<AdmissionStats> {
        let mut stats = AdmissionStats {
            address_connections: self.counter_value(&count_address_key(address)).await?,
            address_blocked: self.cache.exists(&block_address_key(address)).await?,
            address_sockets: self
                .cache
                .set_members(&connections_address_key(address))
                .await?,
            ..Default::default()
        };
        if let Some(user_id) = identity {
            stats.identity_connections =
                self.counter_value(&count_identity_key(user_id)).await?;
            stats.identity_blocked = self.cache.exists(&block_identity_key(user_id)).await?;
        }
        Ok(stats)
    }

    async fn counter_value(&self, key: &str) -> anyhow::Result<u64> {
        let count = self
            .cache
            .get(key)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    /// Administrative unblock.
    pub async fn unblock(&self, address: Option<IpAddr>, identity: Option<UserId>) -> anyhow::Result<()> {
        if let Some(address) = address {
            self.cache.delete(&block_address_key(address)).await?;
        }
        if let Some(user_id) = identity {
            self.cache.delete(&block_identity_key(user_id)).await?;
        }
        Ok(())
    }

    /// Windowed per-identity bid frequency cap. Fails open.
    pub async fn check_bid_rate(&self, user_id: UserId) -> bool {
        let key = format!("admission:bids:{}", user_id);
        let count = fail_open(
            self.cache
                .incr_windowed(&key, self.options.bid_rate_window_secs)
                .await,
            1,
            "bid rate check",
        );
        count <= self.options.bid_rate_limit
    }

    /// Global throttle for the HTTP fallback path. Fails open.
    pub async fn check_global_throttle(&self) -> bool {
        let count = fail_open(
            self.cache
                .incr_windowed("throttle:global", self.options.global_throttle_window_secs)
                .await,
            1,
            "global throttle check",
        );
        count <= self.options.global_throttle_limit
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        clap::Parser,
    };

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        admission: Options,
    }

    #[test]
    fn default_policy() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(cli.admission.max_connections_per_address, 5);
        assert_eq!(cli.admission.max_connections_per_identity, 3);
        assert_eq!(cli.admission.tracking_window_secs, 60);
        assert_eq!(cli.admission.block_duration_secs, 300);
    }

    #[test]
    fn descriptor_round_trips() {
        let descriptor = SocketDescriptor {
            address:      "10.1.2.3".parse().unwrap(),
            user_id:      Some(Uuid::new_v4()),
            connected_at: OffsetDateTime::now_utc(),
        };
        let raw = serde_json::to_string(&descriptor).unwrap();
        let back: SocketDescriptor = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.address, descriptor.address);
        assert_eq!(back.user_id, descriptor.user_id);
    }
}
