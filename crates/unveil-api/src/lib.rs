//! HTTP surface: guest inbox and replies, host send/schedule/preview/stats,
//! and the provider status webhook.

pub mod error;
pub mod guests;
pub mod hosts;
pub mod middleware;
pub mod state;
pub mod webhooks;

use axum::{
    Router,
    routing::{get, post},
};

pub use error::ApiError;
pub use state::AppState;

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/events/{event_id}/messages", get(guests::list_messages))
        .route("/events/{event_id}/messages/{message_id}/reply", post(guests::reply))
        .route("/events/{event_id}/messages/send", post(hosts::send_message))
        .route(
            "/events/{event_id}/scheduled-messages",
            get(hosts::list_scheduled).post(hosts::schedule_message),
        )
        .route("/scheduled-messages/{id}/cancel", post(hosts::cancel_scheduled))
        .route("/events/{event_id}/recipients/preview", post(hosts::preview))
        .route("/messages/{message_id}/stats", get(hosts::message_stats))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let public_routes = Router::new()
        .route("/webhooks/delivery-status", post(webhooks::delivery_status))
        .route("/health", get(health));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
