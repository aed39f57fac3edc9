//! Authoritative store access. One trait covers both capabilities the rest
//! of the server needs (auction state, bid queries); the concrete Postgres
//! implementation is wired once at startup.

#[cfg(test)]
use mockall::automock;
use {
    crate::models::{
        Auction,
        AuctionId,
        Bid,
        User,
        UserId,
    },
    anyhow::Result,
    async_trait::async_trait,
    sqlx::PgPool,
    time::OffsetDateTime,
    uuid::Uuid,
};

#[derive(Debug, Clone)]
pub struct NewBid {
    pub auction_id:       AuctionId,
    pub user_id:          UserId,
    pub amount:           i64,
    pub submission_id:    Uuid,
    /// The highest bid observed under the auction lock. The conditional
    /// update fails if the auction has advanced past it, converting a lost
    /// race into a clean conflict.
    pub observed_highest: i64,
}

#[derive(Debug)]
pub enum RecordBidOutcome {
    Accepted(Bid),
    /// The auction's highest bid advanced beyond the observed value.
    Conflict,
    /// A bid with this submission id was already accepted.
    Duplicate,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn get_auction(&self, auction_id: AuctionId) -> Result<Option<Auction>>;
    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;
    /// Insert an accepted bid, sweep prior bids to OUTBID, and conditionally
    /// advance the auction's highest bid, all in one transaction.
    async fn record_bid(&self, new_bid: NewBid, now: OffsetDateTime) -> Result<RecordBidOutcome>;
    async fn list_bids_by_auction(&self, auction_id: AuctionId, limit: i64) -> Result<Vec<Bid>>;
    async fn activate_due_auctions(&self, now: OffsetDateTime) -> Result<Vec<Auction>>;
    async fn end_due_auctions(&self, now: OffsetDateTime) -> Result<Vec<Auction>>;
}

#[async_trait]
impl Database for PgPool {
    #[tracing::instrument(skip(self))]
    async fn get_auction(&self, auction_id: AuctionId) -> Result<Option<Auction>> {
        let auction = sqlx::query_as::<_, Auction>("SELECT * FROM auctions WHERE id = $1")
            .bind(auction_id)
            .fetch_optional(self)
            .await?;
        Ok(auction)
    }

    #[tracing::instrument(skip(self))]
    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(self)
            .await?;
        Ok(user)
    }

    #[tracing::instrument(skip(self, new_bid), fields(auction_id = %new_bid.auction_id))]
    async fn record_bid(&self, new_bid: NewBid, now: OffsetDateTime) -> Result<RecordBidOutcome> {
        let mut tx = self.begin().await?;

        let inserted = sqlx::query_as::<_, Bid>(
            "INSERT INTO bids (id, auction_id, user_id, amount, status, is_winning, submission_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 'ACCEPTED', TRUE, $5, $6, $6) \
             ON CONFLICT (submission_id) DO NOTHING \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new_bid.auction_id)
        .bind(new_bid.user_id)
        .bind(new_bid.amount)
        .bind(new_bid.submission_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(bid) = inserted else {
            tx.rollback().await?;
            return Ok(RecordBidOutcome::Duplicate);
        };

        sqlx::query(
            "UPDATE bids SET is_winning = FALSE, status = 'OUTBID', updated_at = $3 \
             WHERE auction_id = $1 AND id <> $2 AND status = 'ACCEPTED'",
        )
        .bind(new_bid.auction_id)
        .bind(bid.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE auctions \
             SET current_highest_bid = $1, winner_id = $2, bid_count = bid_count + 1, updated_at = $3 \
             WHERE id = $4 AND status = 'ACTIVE' AND current_highest_bid = $5",
        )
        .bind(new_bid.amount)
        .bind(new_bid.user_id)
        .bind(now)
        .bind(new_bid.auction_id)
        .bind(new_bid.observed_highest)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RecordBidOutcome::Conflict);
        }

        tx.commit().await?;
        Ok(RecordBidOutcome::Accepted(bid))
    }

    #[tracing::instrument(skip(self))]
    async fn list_bids_by_auction(&self, auction_id: AuctionId, limit: i64) -> Result<Vec<Bid>> {
        let bids = sqlx::query_as::<_, Bid>(
            "SELECT * FROM bids WHERE auction_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(auction_id)
        .bind(limit)
        .fetch_all(self)
        .await?;
        Ok(bids)
    }

    #[tracing::instrument(skip(self))]
    async fn activate_due_auctions(&self, now: OffsetDateTime) -> Result<Vec<Auction>> {
        let activated = sqlx::query_as::<_, Auction>(
            "UPDATE auctions SET status = 'ACTIVE', updated_at = $1 \
             WHERE status = 'PENDING' AND start_time <= $1 \
             RETURNING *",
        )
        .bind(now)
        .fetch_all(self)
        .await?;
        Ok(activated)
    }

    #[tracing::instrument(skip(self))]
    async fn end_due_auctions(&self, now: OffsetDateTime) -> Result<Vec<Auction>> {
        let ended = sqlx::query_as::<_, Auction>(
            "UPDATE auctions SET status = 'ENDED', updated_at = $1 \
             WHERE status = 'ACTIVE' AND end_time <= $1 \
             RETURNING *",
        )
        .bind(now)
        .fetch_all(self)
        .await?;
        Ok(ended)
    }
}
