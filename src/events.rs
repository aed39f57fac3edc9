//! Messages that cross process boundaries: the queued bid envelope, the
//! pub/sub bus payloads the gateway fans out, and the notification/audit
//! records emitted alongside bid acceptance.

use {
    crate::models::{
        AuctionId,
        AuctionStatus,
        BidId,
        UserId,
    },
    serde::{
        Deserialize,
        Serialize,
    },
    time::OffsetDateTime,
    uuid::Uuid,
};

pub const GLOBAL_NOTIFICATIONS_CHANNEL: &str = "global:notifications";

pub fn auction_bids_channel(auction_id: AuctionId) -> String {
    format!("auction:{}:bids", auction_id)
}

pub fn auction_events_channel(auction_id: AuctionId) -> String {
    format!("auction:{}:events", auction_id)
}

/// A parsed bus channel name. The subscriber side holds one connection per
/// instance and demultiplexes incoming messages by this.
#[derive(Debug, Clone, PartialEq)]
pub enum BusChannel {
    AuctionBids(AuctionId),
    AuctionEvents(AuctionId),
    GlobalNotifications,
}

impl BusChannel {
    pub fn parse(name: &str) -> Option<Self> {
        if name == GLOBAL_NOTIFICATIONS_CHANNEL {
            return Some(BusChannel::GlobalNotifications);
        }
        let mut parts = name.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("auction"), Some(id), Some("bids"), None) => {
                Some(BusChannel::AuctionBids(id.parse().ok()?))
            }
            (Some("auction"), Some(id), Some("events"), None) => {
                Some(BusChannel::AuctionEvents(id.parse().ok()?))
            }
            _ => None,
        }
    }
}

/// The bid intent plus its provenance, as placed on the queue by the
/// gateway and drained by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidEnvelope {
    pub auction_id:    AuctionId,
    pub user_id:       UserId,
    pub username:      String,
    pub amount:        i64,
    pub socket_id:     Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at:  OffsetDateTime,
    /// Deduplication key; at most one accepted bid per submission id.
    pub submission_id: Uuid,
}

/// Events published on `auction:{id}:bids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BidChannelEvent {
    BidUpdate {
        auction_id: AuctionId,
        bid_id:     BidId,
        user_id:    UserId,
        username:   String,
        amount:     i64,
        #[serde(with = "time::serde::rfc3339")]
        timestamp:  OffsetDateTime,
    },
    /// Broadcast to the whole room; clients ignore events naming
    /// themselves as the new top bidder.
    Outbid {
        auction_id:     AuctionId,
        new_bid_amount: i64,
        new_bid_user:   String,
    },
}

/// Lifecycle events published on `auction:{id}:events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuctionChannelEvent {
    End {
        auction_id:  AuctionId,
        winning_bid: i64,
        winner_id:   Option<UserId>,
    },
    Cancelled { auction_id: AuctionId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BidSuccess,
    BidFailed,
    Outbid,
    AuctionWon,
}

/// Identity-addressed notification. Published durably on the notifications
/// queue and fanned through every instance on `global:notifications`.
/// Delivery is at-least-once; consumers treat it as idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id:    UserId,
    /// Present when the notification should also surface on the
    /// originating socket (e.g. a bid failure).
    pub socket_id:  Option<Uuid>,
    pub kind:       NotificationKind,
    pub auction_id: AuctionId,
    pub amount:     Option<i64>,
    pub message:    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    BidPlaced,
    AuctionEnded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action:     AuditAction,
    pub success:    bool,
    pub auction_id: AuctionId,
    pub user_id:    Option<UserId>,
    pub amount:     Option<i64>,
    pub reason:     Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at:         OffsetDateTime,
}

/// Cached snapshot of the top bid, written on every acceptance (60 s TTL).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopBidSnapshot {
    pub auction_id: AuctionId,
    pub bid_id:     BidId,
    pub user_id:    UserId,
    pub amount:     i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp:  OffsetDateTime,
}

/// Cached auction snapshot (300 s TTL); also the `auctionUpdate` payload
/// emitted to a joining socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub auction_id:          AuctionId,
    pub current_highest_bid: i64,
    pub bid_count:           i64,
    pub status:              AuctionStatus,
    pub winner_id:           Option<UserId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bus_channels() {
        let id = Uuid::new_v4();
        assert_eq!(
            BusChannel::parse(&auction_bids_channel(id)),
            Some(BusChannel::AuctionBids(id))
        );
        assert_eq!(
            BusChannel::parse(&auction_events_channel(id)),
            Some(BusChannel::AuctionEvents(id))
        );
        assert_eq!(
            BusChannel::parse(GLOBAL_NOTIFICATIONS_CHANNEL),
            Some(BusChannel::GlobalNotifications)
        );
        assert_eq!(BusChannel::parse("auction:not-a-uuid:bids"), None);
        assert_eq!(BusChannel::parse("auction:bids"), None);
        assert_eq!(BusChannel::parse(&format!("auction:{}:bids:extra", id)), None);
    }

    #[test]
    fn envelope_round_trips_camel_case() {
        let envelope = BidEnvelope {
            auction_id:    Uuid::new_v4(),
            user_id:       Uuid::new_v4(),
            username:      "u1".to_string(),
            amount:        250_100,
            socket_id:     Some(Uuid::new_v4()),
            submitted_at:  OffsetDateTime::now_utc(),
            submission_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("auctionId").is_some());
        assert!(json.get("submissionId").is_some());
        let back: BidEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.amount, envelope.amount);
        assert_eq!(back.submission_id, envelope.submission_id);
    }
}
