// handlers.rs
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use http::header;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extract::{AppJson, AppPath, AppQuery, BearerToken, ClientIp};
use crate::models::{
    CreatePollInput, OptionInput, OptionValueInput, RepositionInput, UpdatePollInput,
};
use crate::state::AppState;
use crate::validation::{self, RawFilters};

pub async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": &*state.env,
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

pub async fn not_found() -> AppError {
    AppError::NotFound
}

/// Create a poll. The token in the response is never shown again.
pub async fn create_poll(
    State(state): State<AppState>,
    AppJson(input): AppJson<CreatePollInput>,
) -> AppResult<impl IntoResponse> {
    let created = state.polls.create_poll(input).await?;
    let location = format!("/v1/polls/{}", created.poll.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(created)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    search: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
    sort: Option<String>,
}

pub async fn list_polls(
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ListParams>,
) -> AppResult<impl IntoResponse> {
    let filters = validation::parse_filters(RawFilters {
        page: params.page.as_deref(),
        page_size: params.page_size.as_deref(),
        sort: params.sort.as_deref(),
    })?;
    let search = params.search.unwrap_or_default();

    let page = state.polls.list_polls(&search, filters).await?;
    Ok(Json(page))
}

pub async fn show_poll(
    State(state): State<AppState>,
    AppPath(poll_id): AppPath<Uuid>,
) -> AppResult<impl IntoResponse> {
    let poll = state.polls.get_poll(poll_id).await?;
    Ok(Json(json!({ "poll": poll })))
}

pub async fn show_results(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    AppPath(poll_id): AppPath<Uuid>,
) -> AppResult<impl IntoResponse> {
    let results = state.polls.results(poll_id, &ip).await?;
    Ok(Json(json!({ "results": results })))
}

pub async fn vote(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    AppPath((poll_id, option_id)): AppPath<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    state.polls.vote(poll_id, option_id, &ip).await?;
    Ok(Json(json!({ "message": "vote successful" })))
}

pub async fn delete_poll(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    AppPath(poll_id): AppPath<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.polls.delete_poll(poll_id, &token).await?;
    Ok(Json(json!({ "message": "poll successfully deleted" })))
}

pub async fn update_poll(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    AppPath(poll_id): AppPath<Uuid>,
    AppJson(input): AppJson<UpdatePollInput>,
) -> AppResult<impl IntoResponse> {
    let poll = state.polls.update_poll(poll_id, &token, input).await?;
    Ok(Json(json!({ "poll": poll })))
}

pub async fn add_option(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    AppPath(poll_id): AppPath<Uuid>,
    AppJson(input): AppJson<OptionInput>,
) -> AppResult<impl IntoResponse> {
    let poll = state
        .polls
        .add_option(poll_id, &token, &input.value, input.position)
        .await?;
    Ok(Json(json!({ "message": "option added successfully", "poll": poll })))
}

pub async fn update_option_value(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    AppPath((poll_id, option_id)): AppPath<(Uuid, Uuid)>,
    AppJson(input): AppJson<OptionValueInput>,
) -> AppResult<impl IntoResponse> {
    state
        .polls
        .update_option_value(poll_id, &token, option_id, &input.value)
        .await?;
    Ok(Json(json!({ "message": "option updated successfully" })))
}

pub async fn reposition_options(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    AppPath(poll_id): AppPath<Uuid>,
    AppJson(input): AppJson<RepositionInput>,
) -> AppResult<impl IntoResponse> {
    state
        .polls
        .reposition_options(poll_id, &token, &input.options)
        .await?;
    Ok(Json(json!({ "message": "options updated successfully" })))
}

pub async fn delete_option(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    AppPath((poll_id, option_id)): AppPath<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    state.polls.delete_option(poll_id, &token, option_id).await?;
    Ok(Json(json!({ "message": "option deleted successfully" })))
}
