//! Auction lifecycle ticker: activates PENDING auctions whose start time
//! has passed and ends ACTIVE auctions whose end time has passed, fanning
//! the end event out to subscribed rooms.

use {
    crate::{
        events::{
            auction_events_channel,
            AuctionChannelEvent,
            AuditAction,
            AuditEntry,
            Notification,
            NotificationKind,
        },
        models::Auction,
        processor::{
            send_audit,
            send_notification,
        },
        server::SHOULD_EXIT,
        state::Store,
    },
    anyhow::Result,
    std::sync::{
        atomic::Ordering,
        Arc,
    },
    time::OffsetDateTime,
};

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub async fn run_lifecycle_loop(store: Arc<Store>) -> Result<()> {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    tracing::info!("Auction lifecycle loop started.");
    loop {
        if SHOULD_EXIT.load(Ordering::Acquire) {
            return Ok(());
        }
        interval.tick().await;

        let now = OffsetDateTime::now_utc();
        for auction in store.repo.activate_due_auctions(now).await? {
            tracing::info!(auction_id = %auction.id, "Auction activated.");
        }
        for auction in store.repo.end_due_auctions(now).await? {
            conclude_auction(&store, auction).await;
        }
    }
}

/// Emission happens after the status transition is durable and is
/// best-effort, like the processor's post-acceptance publishes.
async fn conclude_auction(store: &Store, auction: Auction) {
    tracing::info!(
        auction_id = %auction.id,
        winner_id = ?auction.winner_id,
        winning_bid = auction.current_highest_bid,
        "Auction ended."
    );

    let event = AuctionChannelEvent::End {
        auction_id:  auction.id,
        winning_bid: auction.current_highest_bid,
        winner_id:   auction.winner_id,
    };
    if let Err(err) = store
        .cache
        .publish_json(&auction_events_channel(auction.id), &event)
        .await
    {
        tracing::error!(error = ?err, auction_id = %auction.id, "Failed to publish auction end.");
    }

    if let Some(winner_id) = auction.winner_id {
        send_notification(
            store,
            Notification {
                user_id:    winner_id,
                socket_id:  None,
                kind:       NotificationKind::AuctionWon,
                auction_id: auction.id,
                amount:     Some(auction.current_highest_bid),
                message:    format!("You won the auction for {}", auction.title),
            },
        )
        .await;
    }

    send_audit(
        store,
        AuditEntry {
            action:     AuditAction::AuctionEnded,
            success:    true,
            auction_id: auction.id,
            user_id:    auction.winner_id,
            amount:     Some(auction.current_highest_bid),
            reason:     None,
            at:         OffsetDateTime::now_utc(),
        },
    )
    .await;
}
