pub(crate) mod channel;
pub(crate) mod error;
pub(crate) mod health;
pub(crate) mod metrics;

use axum::{
    Router,
    routing::{get, put},
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/api/channel/{id}/start", put(channel::start))
        .route("/api/channel/{id}/stop", put(channel::stop))
        .route(
            "/api/channel/{id}/stage",
            get(channel::get_stage).put(channel::put_stage),
        )
        .route(
            "/api/channel/{id}/limit",
            get(channel::get_limit).put(channel::put_limit),
        )
        .route(
            "/api/channel/{id}/alts",
            get(channel::get_alternates)
                .post(channel::add_alternates)
                .delete(channel::remove_alternates),
        )
        .route("/api/channel/{id}/progress", get(channel::progress))
        .route("/api/channel/{id}/pog", get(channel::progress))
        .route(
            "/api/channel/{id}/sentiment/messages",
            get(channel::message_sentiments),
        )
        .route(
            "/api/channel/{id}/sentiment/users",
            get(channel::user_sentiments),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
