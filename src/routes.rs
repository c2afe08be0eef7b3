// routes.rs
use std::any::Any;

use axum::{
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use http::{header, Method};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::error::AppError;
use crate::handlers;
use crate::metrics;
use crate::rate_limit::rate_limit;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/v1/healthcheck", get(handlers::healthcheck))
        .route(
            "/v1/polls",
            get(handlers::list_polls).post(handlers::create_poll),
        )
        .route(
            "/v1/polls/{poll_id}",
            get(handlers::show_poll)
                .patch(handlers::update_poll)
                .delete(handlers::delete_poll),
        )
        .route("/v1/polls/{poll_id}/results", get(handlers::show_results))
        .route(
            "/v1/polls/{poll_id}/options",
            post(handlers::add_option).patch(handlers::reposition_options),
        )
        .route(
            "/v1/polls/{poll_id}/options/{option_id}",
            post(handlers::vote)
                .patch(handlers::update_option_value)
                .delete(handlers::delete_option),
        )
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    // Metrics are not rate-limited.
    Router::new()
        .route("/v1/metrics", get(metrics::show))
        .merge(api)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(state.clone(), metrics::track))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Turns a handler panic into the generic 500 envelope.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");

    AppError::internal(format!("handler panicked: {detail}")).into_response()
}
