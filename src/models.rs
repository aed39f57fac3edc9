use {
    serde::{
        Deserialize,
        Serialize,
    },
    sqlx::prelude::FromRow,
    time::OffsetDateTime,
    uuid::Uuid,
};

pub type UserId = Uuid;
pub type AuctionId = Uuid;
pub type BidId = Uuid;

#[derive(Clone, FromRow)]
#[allow(dead_code)]
pub struct User {
    pub id:            UserId,
    pub username:      String,
    pub email:         String,
    pub password_hash: String,
    pub created_at:    OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "auction_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AuctionStatus {
    Pending,
    Active,
    Ended,
}

#[derive(Clone, FromRow)]
pub struct Auction {
    pub id:                  AuctionId,
    pub title:               String,
    pub description:         String,
    pub car_id:              String,
    /// Positive integer minor currency units.
    pub starting_bid:        i64,
    /// Initialized to `starting_bid`, monotonically non-decreasing.
    pub current_highest_bid: i64,
    pub bid_count:           i64,
    pub start_time:          OffsetDateTime,
    pub end_time:            OffsetDateTime,
    pub winner_id:           Option<UserId>,
    pub status:              AuctionStatus,
    pub created_at:          OffsetDateTime,
    pub updated_at:          OffsetDateTime,
}

impl Auction {
    /// Whether the bidding window is open at `now`. The window is
    /// half-open: a bid arriving exactly at `end_time` is outside it.
    pub fn is_in_window(&self, now: OffsetDateTime) -> bool {
        self.start_time <= now && now < self.end_time
    }
}

#[derive(Clone, Debug, PartialEq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "bid_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Outbid,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Bid {
    pub id:            BidId,
    pub auction_id:    AuctionId,
    pub user_id:       UserId,
    pub amount:        i64,
    pub status:        BidStatus,
    pub is_winning:    bool,
    /// Deduplication key stamped by the gateway on every envelope.
    pub submission_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at:    OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at:    OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        time::Duration,
    };

    fn auction_with_window(start: OffsetDateTime, end: OffsetDateTime) -> Auction {
        Auction {
            id:                  Uuid::new_v4(),
            title:               "test".to_string(),
            description:         String::new(),
            car_id:              "car-1".to_string(),
            starting_bid:        250_000,
            current_highest_bid: 250_000,
            bid_count:           0,
            start_time:          start,
            end_time:            end,
            winner_id:           None,
            status:              AuctionStatus::Active,
            created_at:          start,
            updated_at:          start,
        }
    }

    #[test]
    fn window_is_half_open() {
        let now = OffsetDateTime::now_utc();
        let auction = auction_with_window(now - Duration::hours(1), now + Duration::hours(1));
        assert!(auction.is_in_window(now));
        assert!(auction.is_in_window(auction.start_time));
        assert!(auction.is_in_window(auction.end_time - Duration::milliseconds(1)));
        assert!(!auction.is_in_window(auction.end_time));
        assert!(!auction.is_in_window(auction.start_time - Duration::milliseconds(1)));
    }
}
