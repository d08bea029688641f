use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::events::EventKind;
use crate::lifecycle::PowerState;
use crate::reload::ReloadRequest;
use crate::service::ServiceStatus;

#[derive(Serialize)]
pub struct FeedResponse {
    pub kind: EventKind,
    pub accepted: bool,
    pub running: bool,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub request: &'static str,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<ServiceStatus> {
    Json(state.service.status())
}

pub async fn acquire_event(
    State(state): State<AdminState>,
    Path(kind): Path<String>,
) -> Result<Json<FeedResponse>, StatusCode> {
    let kind = parse_kind(&kind)?;
    let accepted = state.service.acquire_event(kind);
    Ok(Json(feed_response(&state, kind, accepted)))
}

pub async fn release_event(
    State(state): State<AdminState>,
    Path(kind): Path<String>,
) -> Result<Json<FeedResponse>, StatusCode> {
    let kind = parse_kind(&kind)?;
    let accepted = state.service.release_event(kind);
    Ok(Json(feed_response(&state, kind, accepted)))
}

pub async fn reload(State(state): State<AdminState>) -> (StatusCode, Json<ReloadResponse>) {
    let (status, request) = match state.service.request_reload() {
        ReloadRequest::Queued => (StatusCode::ACCEPTED, "queued"),
        ReloadRequest::Coalesced => (StatusCode::ACCEPTED, "coalesced"),
        ReloadRequest::Closed => (StatusCode::SERVICE_UNAVAILABLE, "closed"),
    };
    (status, Json(ReloadResponse { request }))
}

pub async fn set_power(
    State(state): State<AdminState>,
    Path(power): Path<String>,
) -> Result<Json<ServiceStatus>, StatusCode> {
    let power: PowerState = power.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    state.service.on_power_changed(power);
    Ok(Json(state.service.status()))
}

pub async fn start_engine(State(state): State<AdminState>) -> Result<StatusCode, (StatusCode, String)> {
    state
        .service
        .start_engine()
        .await
        .map(|()| StatusCode::ACCEPTED)
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))
}

pub async fn stop_engine(State(state): State<AdminState>) -> Result<StatusCode, (StatusCode, String)> {
    state
        .service
        .stop_engine()
        .await
        .map(|()| StatusCode::ACCEPTED)
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))
}

fn parse_kind(kind: &str) -> Result<EventKind, StatusCode> {
    kind.parse().map_err(|_| StatusCode::NOT_FOUND)
}

fn feed_response(state: &AdminState, kind: EventKind, accepted: bool) -> FeedResponse {
    FeedResponse {
        kind,
        accepted,
        running: state.service.poll_controller().is_running(kind),
    }
}
