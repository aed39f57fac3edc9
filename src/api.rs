use {
    crate::{
        config::RunOptions,
        processor::BidRejection,
        server::SHOULD_EXIT,
        state::Store,
    },
    anyhow::Result,
    axum::{
        http::StatusCode,
        response::{
            IntoResponse,
            Response,
        },
        routing::{
            get,
            post,
        },
        Router,
    },
    clap::crate_version,
    std::{
        net::SocketAddr,
        sync::{
            atomic::Ordering,
            Arc,
        },
    },
    tower_http::cors::CorsLayer,
};

mod admission;
mod bid;
pub mod ws;

async fn root() -> String {
    format!("Gavel Auction Server API {}", crate_version!())
}

async fn live() -> StatusCode {
    StatusCode::OK
}

pub enum RestError {
    /// The request contained invalid parameters.
    BadParameters(String),
    /// The bid was rejected by the processor.
    BidRejected(BidRejection),
    /// A bid with this submission id was already accepted.
    DuplicateSubmission,
    /// The global throttle kicked in.
    TooManyRequests,
    /// The server cannot currently serialize bids for this auction.
    TemporarilyUnavailable,
    /// A catch-all for all other errors during processing.
    Unknown,
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        match self {
            RestError::BadParameters(msg) => {
                (StatusCode::BAD_REQUEST, format!("Bad parameters: {}", msg)).into_response()
            }
            RestError::BidRejected(rejection) => {
                (StatusCode::BAD_REQUEST, format!("Bid rejected: {}", rejection)).into_response()
            }
            RestError::DuplicateSubmission => (
                StatusCode::CONFLICT,
                "A bid with this submission id was already processed",
            )
                .into_response(),
            RestError::TooManyRequests => {
                (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response()
            }
            RestError::TemporarilyUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "This service is temporarily unavailable",
            )
                .into_response(),
            RestError::Unknown => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unknown error occurred processing the request",
            )
                .into_response(),
        }
    }
}

pub async fn start_api(run_options: RunOptions, store: Arc<Store>) -> Result<()> {
    let app: Router = Router::new()
        .route("/", get(root))
        .route("/live", get(live))
        .route("/bids", post(bid::post_bid))
        .route("/admission/stats", get(admission::get_stats))
        .route("/admission/unblock", post(admission::post_unblock))
        .route("/ws", get(ws::ws_route_handler))
        .layer(CorsLayer::permissive())
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(&run_options.server.listen_addr).await?;
    tracing::info!(addr = %run_options.server.listen_addr, "API server listening.");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        while !SHOULD_EXIT.load(Ordering::Acquire) {
            tokio::time::sleep(crate::server::EXIT_CHECK_INTERVAL).await;
        }
        tracing::info!("Shutting down API server...");
    })
    .await?;
    Ok(())
}
