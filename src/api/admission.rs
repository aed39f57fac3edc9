//! Administrative surface for the admission controller.

use {
    crate::{
        admission::AdmissionStats,
        api::RestError,
        models::UserId,
        state::Store,
    },
    axum::{
        extract::{
            Query,
            State,
        },
        http::StatusCode,
        Json,
    },
    serde::Deserialize,
    std::{
        net::IpAddr,
        sync::Arc,
    },
};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub address: IpAddr,
    pub user_id: Option<UserId>,
}

pub async fn get_stats(
    State(store): State<Arc<Store>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<AdmissionStats>, RestError> {
    store
        .admission
        .stats(query.address, query.user_id)
        .await
        .map(Json)
        .map_err(|err| {
            tracing::error!(error = ?err, "Failed to read admission stats.");
            RestError::TemporarilyUnavailable
        })
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UnblockRequest {
    pub address: Option<IpAddr>,
    pub user_id: Option<UserId>,
}

pub async fn post_unblock(
    State(store): State<Arc<Store>>,
    Json(request): Json<UnblockRequest>,
) -> Result<StatusCode, RestError> {
    if request.address.is_none() && request.user_id.is_none() {
        return Err(RestError::BadParameters(
            "address or userId is required".to_string(),
        ));
    }
    store
        .admission
        .unblock(request.address, request.user_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| {
            tracing::error!(error = ?err, "Failed to unblock.");
            RestError::TemporarilyUnavailable
        })
}
