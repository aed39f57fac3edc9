//! The serialized bid processor: the single authoritative arbiter of bid
//! acceptance. Registered as the consumer of the bid-placed queue and also
//! invoked in-process by the HTTP fallback path.
//!
//! Per-auction serialization comes from the distributed lock; bids for
//! different auctions proceed in parallel. Accepted order is lock
//! acquisition order, not submission order.

use {
    crate::{
        cache,
        events::{
            auction_bids_channel,
            AuditAction,
            AuditEntry,
            AuctionSnapshot,
            BidChannelEvent,
            BidEnvelope,
            Notification,
            NotificationKind,
            TopBidSnapshot,
            GLOBAL_NOTIFICATIONS_CHANNEL,
        },
        models::{
            Auction,
            AuctionStatus,
            Bid,
            UserId,
        },
        queue::Topic,
        repository::{
            Database,
            NewBid,
            RecordBidOutcome,
        },
        server::{
            EXIT_CHECK_INTERVAL,
            SHOULD_EXIT,
        },
        state::Store,
    },
    anyhow::{
        anyhow,
        Result,
    },
    clap::Args,
    std::sync::{
        atomic::Ordering,
        Arc,
    },
    thiserror::Error,
    time::OffsetDateTime,
    uuid::Uuid,
};

const DEFAULT_MIN_BID_INCREMENT: &str = "100";
const DEFAULT_LOCK_TTL_SECS: &str = "10";
const DEFAULT_QUEUE_PREFETCH: &str = "10";

const TOP_BID_SNAPSHOT_TTL_SECS: u64 = 60;
const AUCTION_SNAPSHOT_TTL_SECS: u64 = 300;

#[derive(Args, Clone, Debug)]
#[command(next_help_heading = "Processor Options")]
#[group(id = "Processor")]
pub struct Options {
    /// Minimum amount a bid must exceed the current highest by, in minor
    /// currency units. Authoritative; gateway-side validation is advisory.
    #[arg(long = "min-bid-increment")]
    #[arg(default_value = DEFAULT_MIN_BID_INCREMENT)]
    #[arg(env = "MIN_BID_INCREMENT")]
    pub min_bid_increment: i64,
    /// TTL of the per-auction distributed lock, in seconds.
    #[arg(long = "lock-ttl-secs")]
    #[arg(default_value = DEFAULT_LOCK_TTL_SECS)]
    #[arg(env = "LOCK_TTL_SECS")]
    pub lock_ttl_secs:     u64,
    /// Maximum unacknowledged messages per worker.
    #[arg(long = "queue-prefetch")]
    #[arg(default_value = DEFAULT_QUEUE_PREFETCH)]
    #[arg(env = "QUEUE_PREFETCH")]
    pub queue_prefetch:    i64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BidRejection {
    #[error("auction not found")]
    AuctionNotFound,
    #[error("auction is not active")]
    AuctionNotActive,
    #[error("auction has not started yet")]
    AuctionNotStarted,
    #[error("auction has already ended")]
    AuctionEnded,
    #[error("bid must be at least {min_accepted}")]
    BelowMinimum { min_accepted: i64 },
    #[error("bid below current highest")]
    BelowCurrentHighest,
    #[error("bidder not found")]
    UnknownBidder,
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Accepted(Bid),
    Rejected(BidRejection),
    /// A bid with this submission id was already processed.
    Duplicate,
    /// The per-auction lock could not be acquired; the message dead-letters
    /// and the client retries by user action.
    LockUnavailable,
}

struct AcceptedBid {
    bid:             Bid,
    username:        String,
    bid_count:       i64,
    previous_winner: Option<UserId>,
}

enum Evaluation {
    Accepted(AcceptedBid),
    Rejected(BidRejection),
    Duplicate,
}

/// Validate a bid against the authoritative auction record. Pure; the
/// caller holds the auction lock.
fn validate_bid(
    auction: &Auction,
    amount: i64,
    now: OffsetDateTime,
    min_increment: i64,
) -> Result<(), BidRejection> {
    if auction.status != AuctionStatus::Active {
        return Err(BidRejection::AuctionNotActive);
    }
    if !auction.is_in_window(now) {
        return Err(if now < auction.start_time {
            BidRejection::AuctionNotStarted
        } else {
            BidRejection::AuctionEnded
        });
    }
    let min_accepted = auction.current_highest_bid + min_increment;
    if amount < min_accepted {
        return Err(BidRejection::BelowMinimum { min_accepted });
    }
    Ok(())
}

/// Load, validate, write. Runs under the auction lock; side effects are
/// the caller's concern.
async fn evaluate(
    repo: &dyn Database,
    envelope: &BidEnvelope,
    min_increment: i64,
    now: OffsetDateTime,
) -> Result<Evaluation> {
    let Some(auction) = repo.get_auction(envelope.auction_id).await? else {
        return Ok(Evaluation::Rejected(BidRejection::AuctionNotFound));
    };
    if let Err(rejection) = validate_bid(&auction, envelope.amount, now, min_increment) {
        return Ok(Evaluation::Rejected(rejection));
    }
    let Some(user) = repo.get_user(envelope.user_id).await? else {
        return Ok(Evaluation::Rejected(BidRejection::UnknownBidder));
    };

    let previous_winner = auction.winner_id.filter(|winner| *winner != user.id);
    let outcome = repo
        .record_bid(
            NewBid {
                auction_id:       envelope.auction_id,
                user_id:          user.id,
                amount:           envelope.amount,
                submission_id:    envelope.submission_id,
                observed_highest: auction.current_highest_bid,
            },
            now,
        )
        .await?;

    Ok(match outcome {
        RecordBidOutcome::Accepted(bid) => Evaluation::Accepted(AcceptedBid {
            bid,
            username: user.username,
            bid_count: auction.bid_count + 1,
            previous_winner,
        }),
        // Lost race at the conditional update, e.g. after losing the lock
        // to its TTL. Surfaced like any other below-highest rejection.
        RecordBidOutcome::Conflict => Evaluation::Rejected(BidRejection::BelowCurrentHighest),
        RecordBidOutcome::Duplicate => Evaluation::Duplicate,
    })
}

/// Process one bid envelope end to end: lock, validate, write, publish.
/// The lock is released unconditionally.
#[tracing::instrument(skip_all, fields(auction_id = %envelope.auction_id, user_id = %envelope.user_id))]
pub async fn process(store: &Store, envelope: &BidEnvelope) -> Result<ProcessOutcome> {
    let lock_key = cache::lock_key(envelope.auction_id);
    let holder = format!("{}:{}", store.worker_id, Uuid::new_v4());
    let acquired = store
        .cache
        .try_acquire_lock(&lock_key, &holder, store.processor.lock_ttl_secs * 1000)
        .await?;
    if !acquired {
        tracing::debug!(auction_id = %envelope.auction_id, "Auction lock busy.");
        return Ok(ProcessOutcome::LockUnavailable);
    }

    let now = OffsetDateTime::now_utc();
    let result = evaluate(store.repo.as_ref(), envelope, store.processor.min_bid_increment, now).await;

    let outcome = match result {
        Ok(Evaluation::Accepted(accepted)) => {
            emit_accept_effects(store, envelope, &accepted).await;
            Ok(ProcessOutcome::Accepted(accepted.bid))
        }
        Ok(Evaluation::Rejected(rejection)) => {
            emit_reject_effects(store, envelope, &rejection).await;
            Ok(ProcessOutcome::Rejected(rejection))
        }
        Ok(Evaluation::Duplicate) => {
            tracing::info!(submission_id = %envelope.submission_id, "Dropping duplicate submission.");
            Ok(ProcessOutcome::Duplicate)
        }
        Err(err) => {
            emit_failure_effects(store, envelope).await;
            Err(err)
        }
    };

    if let Err(err) = store.cache.release_lock(&lock_key, &holder).await {
        tracing::warn!(error = ?err, auction_id = %envelope.auction_id, "Failed to release auction lock.");
    }
    outcome
}

/// Snapshots, bid-update fan-out, notifications, audit. All best-effort;
/// the bid is already durable.
async fn emit_accept_effects(store: &Store, envelope: &BidEnvelope, accepted: &AcceptedBid) {
    let bid = &accepted.bid;
    let top = TopBidSnapshot {
        auction_id: bid.auction_id,
        bid_id:     bid.id,
        user_id:    bid.user_id,
        amount:     bid.amount,
        timestamp:  bid.created_at,
    };
    let snapshot = AuctionSnapshot {
        auction_id:          bid.auction_id,
        current_highest_bid: bid.amount,
        bid_count:           accepted.bid_count,
        status:              AuctionStatus::Active,
        winner_id:           Some(bid.user_id),
    };
    if let Err(err) = store
        .cache
        .set_json_ex(&cache::top_bid_key(bid.auction_id), &top, TOP_BID_SNAPSHOT_TTL_SECS)
        .await
    {
        tracing::warn!(error = ?err, "Failed to write top-bid snapshot.");
    }
    if let Err(err) = store
        .cache
        .set_json_ex(
            &cache::auction_snapshot_key(bid.auction_id),
            &snapshot,
            AUCTION_SNAPSHOT_TTL_SECS,
        )
        .await
    {
        tracing::warn!(error = ?err, "Failed to write auction snapshot.");
    }

    let channel = auction_bids_channel(bid.auction_id);
    let update = BidChannelEvent::BidUpdate {
        auction_id: bid.auction_id,
        bid_id:     bid.id,
        user_id:    bid.user_id,
        username:   accepted.username.clone(),
        amount:     bid.amount,
        timestamp:  bid.created_at,
    };
    if let Err(err) = store.cache.publish_json(&channel, &update).await {
        tracing::error!(error = ?err, "Failed to publish bid update.");
    }

    if let Some(previous_winner) = accepted.previous_winner {
        let outbid_event = BidChannelEvent::Outbid {
            auction_id:     bid.auction_id,
            new_bid_amount: bid.amount,
            new_bid_user:   accepted.username.clone(),
        };
        if let Err(err) = store.cache.publish_json(&channel, &outbid_event).await {
            tracing::error!(error = ?err, "Failed to publish outbid event.");
        }
        send_notification(
            store,
            Notification {
                user_id:    previous_winner,
                socket_id:  None,
                kind:       NotificationKind::Outbid,
                auction_id: bid.auction_id,
                amount:     Some(bid.amount),
                message:    format!("You have been outbid: the new highest bid is {}", bid.amount),
            },
        )
        .await;
    }

    send_notification(
        store,
        Notification {
            user_id:    bid.user_id,
            socket_id:  envelope.socket_id,
            kind:       NotificationKind::BidSuccess,
            auction_id: bid.auction_id,
            amount:     Some(bid.amount),
            message:    "Your bid was accepted".to_string(),
        },
    )
    .await;

    send_audit(
        store,
        AuditEntry {
            action:     AuditAction::BidPlaced,
            success:    true,
            auction_id: bid.auction_id,
            user_id:    Some(bid.user_id),
            amount:     Some(bid.amount),
            reason:     None,
            at:         bid.created_at,
        },
    )
    .await;
}

async fn emit_reject_effects(store: &Store, envelope: &BidEnvelope, rejection: &BidRejection) {
    send_notification(
        store,
        Notification {
            user_id:    envelope.user_id,
            socket_id:  envelope.socket_id,
            kind:       NotificationKind::BidFailed,
            auction_id: envelope.auction_id,
            amount:     Some(envelope.amount),
            message:    rejection.to_string(),
        },
    )
    .await;
    send_audit(
        store,
        AuditEntry {
            action:     AuditAction::BidPlaced,
            success:    false,
            auction_id: envelope.auction_id,
            user_id:    Some(envelope.user_id),
            amount:     Some(envelope.amount),
            reason:     Some(rejection.to_string()),
            at:         OffsetDateTime::now_utc(),
        },
    )
    .await;
}

async fn emit_failure_effects(store: &Store, envelope: &BidEnvelope) {
    send_notification(
        store,
        Notification {
            user_id:    envelope.user_id,
            socket_id:  envelope.socket_id,
            kind:       NotificationKind::BidFailed,
            auction_id: envelope.auction_id,
            amount:     Some(envelope.amount),
            message:    "Bid processing failed, please retry".to_string(),
        },
    )
    .await;
    send_audit(
        store,
        AuditEntry {
            action:     AuditAction::BidPlaced,
            success:    false,
            auction_id: envelope.auction_id,
            user_id:    Some(envelope.user_id),
            amount:     Some(envelope.amount),
            reason:     Some("internal error".to_string()),
            at:         OffsetDateTime::now_utc(),
        },
    )
    .await;
}

/// Durable copy on the notifications queue plus a realtime copy on the
/// global channel for every gateway instance.
pub(crate) async fn send_notification(store: &Store, notification: Notification) {
    if let Err(err) = store.queue.publish_notification(&notification).await {
        tracing::warn!(error = ?err, "Failed to queue notification.");
    }
    if let Err(err) = store
        .cache
        .publish_json(GLOBAL_NOTIFICATIONS_CHANNEL, &notification)
        .await
    {
        tracing::warn!(error = ?err, "Failed to fan out notification.");
    }
}

pub(crate) async fn send_audit(store: &Store, entry: AuditEntry) {
    if let Err(err) = store.queue.publish_audit(&entry).await {
        tracing::warn!(error = ?err, "Failed to queue audit entry.");
    }
}

/// Drain the bid-placed queue until shutdown.
pub async fn run_bid_consumer(store: Arc<Store>) -> Result<()> {
    let Some(mut messages) = store.queue.consumer_messages(Topic::BidPlaced).await? else {
        tracing::warn!("Queue disabled, bid consumer not started.");
        return Ok(());
    };
    tracing::info!("Bid consumer started.");

    loop {
        if SHOULD_EXIT.load(Ordering::Acquire) {
            return Ok(());
        }
        tokio::select! {
            next = messages.next() => {
                match next {
                    None => return Err(anyhow!("Bid consumer stream closed")),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(message)) => handle_message(&store, message).await?,
                }
            }
            _ = tokio::time::sleep(EXIT_CHECK_INTERVAL) => {}
        }
    }
}

async fn handle_message(store: &Store, message: crate::queue::QueueMessage) -> Result<()> {
    let envelope: BidEnvelope = match serde_json::from_slice(message.payload()) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = ?err, "Dead-lettering undecodable bid envelope.");
            return store.queue.dead_letter(&message).await;
        }
    };

    match process(store, &envelope).await {
        Ok(ProcessOutcome::Accepted(_)) | Ok(ProcessOutcome::Duplicate) => message.ack().await,
        // Rejections are surfaced through notifications and never retried.
        Ok(ProcessOutcome::Rejected(_)) => store.queue.dead_letter(&message).await,
        Ok(ProcessOutcome::LockUnavailable) => store.queue.dead_letter(&message).await,
        Err(err) => {
            tracing::error!(error = ?err, "Bid processing failed.");
            store.queue.dead_letter(&message).await
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            models::BidStatus,
            repository::MockDatabase,
        },
        time::Duration,
    };

    const INCREMENT: i64 = 100;

    fn active_auction(now: OffsetDateTime) -> Auction {
        Auction {
            id:                  Uuid::new_v4(),
            title:               "1968 Mustang".to_string(),
            description:         String::new(),
            car_id:              "car-1".to_string(),
            starting_bid:        250_000,
            current_highest_bid: 250_000,
            bid_count:           0,
            start_time:          now - Duration::hours(1),
            end_time:            now + Duration::hours(1),
            winner_id:           None,
            status:              AuctionStatus::Active,
            created_at:          now - Duration::hours(2),
            updated_at:          now - Duration::hours(1),
        }
    }

    fn envelope_for(auction: &Auction, amount: i64) -> BidEnvelope {
        BidEnvelope {
            auction_id:    auction.id,
            user_id:       Uuid::new_v4(),
            username:      "u1".to_string(),
            amount,
            socket_id:     None,
            submitted_at:  OffsetDateTime::now_utc(),
            submission_id: Uuid::new_v4(),
        }
    }

    fn user_row(id: Uuid, username: &str) -> crate::models::User {
        crate::models::User {
            id,
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password_hash: "x".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn accepted_row(envelope: &BidEnvelope, now: OffsetDateTime) -> Bid {
        Bid {
            id:            Uuid::new_v4(),
            auction_id:    envelope.auction_id,
            user_id:       envelope.user_id,
            amount:        envelope.amount,
            status:        BidStatus::Accepted,
            is_winning:    true,
            submission_id: envelope.submission_id,
            created_at:    now,
            updated_at:    now,
        }
    }

    #[test]
    fn accepts_exact_minimum_and_rejects_one_less() {
        let now = OffsetDateTime::now_utc();
        let auction = active_auction(now);
        assert!(validate_bid(&auction, 250_100, now, INCREMENT).is_ok());
        assert_eq!(
            validate_bid(&auction, 250_099, now, INCREMENT),
            Err(BidRejection::BelowMinimum { min_accepted: 250_100 })
        );
    }

    #[test]
    fn rejects_at_end_time_accepts_just_before() {
        let now = OffsetDateTime::now_utc();
        let auction = active_auction(now);
        assert_eq!(
            validate_bid(&auction, 250_100, auction.end_time, INCREMENT),
            Err(BidRejection::AuctionEnded)
        );
        assert!(validate_bid(
            &auction,
            250_100,
            auction.end_time - Duration::milliseconds(1),
            INCREMENT
        )
        .is_ok());
    }

    #[test]
    fn rejects_outside_active_status() {
        let now = OffsetDateTime::now_utc();
        let mut auction = active_auction(now);
        auction.status = AuctionStatus::Pending;
        assert_eq!(
            validate_bid(&auction, 250_100, now, INCREMENT),
            Err(BidRejection::AuctionNotActive)
        );
        auction.status = AuctionStatus::Active;
        auction.start_time = now + Duration::minutes(5);
        assert_eq!(
            validate_bid(&auction, 250_100, now, INCREMENT),
            Err(BidRejection::AuctionNotStarted)
        );
    }

    #[tokio::test]
    async fn evaluates_accepted_bid() {
        let now = OffsetDateTime::now_utc();
        let auction = active_auction(now);
        let envelope = envelope_for(&auction, 250_100);
        let bidder = envelope.user_id;

        let mut repo = MockDatabase::new();
        let auction_clone = auction.clone();
        repo.expect_get_auction()
            .returning(move |_| Ok(Some(auction_clone.clone())));
        repo.expect_get_user()
            .returning(move |id| Ok(Some(user_row(id, "u1"))));
        let envelope_clone = envelope.clone();
        repo.expect_record_bid()
            .withf(move |new_bid, _| {
                new_bid.observed_highest == 250_000 && new_bid.amount == 250_100
            })
            .returning(move |_, now| {
                Ok(RecordBidOutcome::Accepted(accepted_row(&envelope_clone, now)))
            });

        match evaluate(&repo, &envelope, INCREMENT, now).await.unwrap() {
            Evaluation::Accepted(accepted) => {
                assert_eq!(accepted.bid.user_id, bidder);
                assert!(accepted.bid.is_winning);
                assert_eq!(accepted.bid_count, 1);
                assert_eq!(accepted.previous_winner, None);
            }
            other => panic!("expected acceptance, got {:?}", discriminant_name(&other)),
        }
    }

    #[tokio::test]
    async fn lost_race_surfaces_as_below_current_highest() {
        let now = OffsetDateTime::now_utc();
        let auction = active_auction(now);
        let envelope = envelope_for(&auction, 250_100);

        let mut repo = MockDatabase::new();
        let auction_clone = auction.clone();
        repo.expect_get_auction()
            .returning(move |_| Ok(Some(auction_clone.clone())));
        repo.expect_get_user()
            .returning(move |id| Ok(Some(user_row(id, "u1"))));
        repo.expect_record_bid()
            .returning(|_, _| Ok(RecordBidOutcome::Conflict));

        match evaluate(&repo, &envelope, INCREMENT, now).await.unwrap() {
            Evaluation::Rejected(BidRejection::BelowCurrentHighest) => {}
            other => panic!("expected conflict rejection, got {:?}", discriminant_name(&other)),
        }
    }

    #[tokio::test]
    async fn duplicate_submission_is_a_no_op() {
        let now = OffsetDateTime::now_utc();
        let auction = active_auction(now);
        let envelope = envelope_for(&auction, 250_100);

        let mut repo = MockDatabase::new();
        let auction_clone = auction.clone();
        repo.expect_get_auction()
            .returning(move |_| Ok(Some(auction_clone.clone())));
        repo.expect_get_user()
            .returning(move |id| Ok(Some(user_row(id, "u1"))));
        repo.expect_record_bid()
            .returning(|_, _| Ok(RecordBidOutcome::Duplicate));

        assert!(matches!(
            evaluate(&repo, &envelope, INCREMENT, now).await.unwrap(),
            Evaluation::Duplicate
        ));
    }

    #[tokio::test]
    async fn previous_winner_is_reported_for_outbid() {
        let now = OffsetDateTime::now_utc();
        let mut auction = active_auction(now);
        let previous = Uuid::new_v4();
        auction.winner_id = Some(previous);
        auction.current_highest_bid = 250_100;
        auction.bid_count = 1;
        let envelope = envelope_for(&auction, 250_200);

        let mut repo = MockDatabase::new();
        let auction_clone = auction.clone();
        repo.expect_get_auction()
            .returning(move |_| Ok(Some(auction_clone.clone())));
        repo.expect_get_user()
            .returning(move |id| Ok(Some(user_row(id, "u2"))));
        let envelope_clone = envelope.clone();
        repo.expect_record_bid()
            .returning(move |_, now| {
                Ok(RecordBidOutcome::Accepted(accepted_row(&envelope_clone, now)))
            });

        match evaluate(&repo, &envelope, INCREMENT, now).await.unwrap() {
            Evaluation::Accepted(accepted) => {
                assert_eq!(accepted.previous_winner, Some(previous));
                assert_eq!(accepted.bid_count, 2);
            }
            other => panic!("expected acceptance, got {:?}", discriminant_name(&other)),
        }
    }

    #[tokio::test]
    async fn unknown_auction_and_bidder_are_rejected() {
        let now = OffsetDateTime::now_utc();
        let auction = active_auction(now);
        let envelope = envelope_for(&auction, 250_100);

        let mut repo = MockDatabase::new();
        repo.expect_get_auction().returning(|_| Ok(None));
        assert!(matches!(
            evaluate(&repo, &envelope, INCREMENT, now).await.unwrap(),
            Evaluation::Rejected(BidRejection::AuctionNotFound)
        ));

        let mut repo = MockDatabase::new();
        let auction_clone = auction.clone();
        repo.expect_get_auction()
            .returning(move |_| Ok(Some(auction_clone.clone())));
        repo.expect_get_user().returning(|_| Ok(None));
        assert!(matches!(
            evaluate(&repo, &envelope, INCREMENT, now).await.unwrap(),
            Evaluation::Rejected(BidRejection::UnknownBidder)
        ));
    }

    fn discriminant_name(evaluation: &Evaluation) -> &'static str {
        match evaluation {
            Evaluation::Accepted(_) => "Accepted",
            Evaluation::Rejected(_) => "Rejected",
            Evaluation::Duplicate => "Duplicate",
        }
    }
}
