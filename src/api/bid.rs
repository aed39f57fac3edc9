//! HTTP fallback for bid submission when the socket path is unavailable.
//! Runs the same processor path as queued bids, so the acceptance
//! invariants are identical.

use {
    crate::{
        api::RestError,
        events::BidEnvelope,
        models::{
            AuctionId,
            Bid,
            UserId,
        },
        processor::{
            self,
            ProcessOutcome,
        },
        state::Store,
    },
    axum::{
        extract::State,
        Json,
    },
    serde::Deserialize,
    std::sync::Arc,
    time::OffsetDateTime,
    uuid::Uuid,
};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBid {
    pub auction_id: AuctionId,
    pub bid_amount: i64,
    pub user_id:    UserId,
}

pub async fn post_bid(
    State(store): State<Arc<Store>>,
    Json(request): Json<SubmitBid>,
) -> Result<Json<Bid>, RestError> {
    if !store.admission.check_global_throttle().await {
        return Err(RestError::TooManyRequests);
    }
    if request.bid_amount <= 0 {
        return Err(RestError::BadParameters(
            "bid amount must be positive".to_string(),
        ));
    }

    let envelope = BidEnvelope {
        auction_id:    request.auction_id,
        user_id:       request.user_id,
        // The processor resolves the username from the user record.
        username:      String::new(),
        amount:        request.bid_amount,
        socket_id:     None,
        submitted_at:  OffsetDateTime::now_utc(),
        submission_id: Uuid::new_v4(),
    };

    match processor::process(&store, &envelope).await {
        Ok(ProcessOutcome::Accepted(bid)) => Ok(Json(bid)),
        Ok(ProcessOutcome::Rejected(rejection)) => Err(RestError::BidRejected(rejection)),
        Ok(ProcessOutcome::Duplicate) => Err(RestError::DuplicateSubmission),
        Ok(ProcessOutcome::LockUnavailable) => Err(RestError::TemporarilyUnavailable),
        Err(err) => {
            tracing::error!(error = ?err, "Fallback bid processing failed.");
            Err(RestError::Unknown)
        }
    }
}
