//! Per-channel control routes: start/stop, stage and limit, alternates, progress and the
//! sentiment views.

use std::collections::{BTreeMap, BTreeSet};

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ControlError;
use crate::app::AppState;
use crate::pipeline::stage::Stage;
use crate::store::models::{AttemptStatus, Channel, MessageSentiment, UserAlternate, UserSentiment};

#[derive(Debug, Serialize)]
struct Accepted {
    channel_id: String,
    status: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StageBody {
    stage: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LimitBody {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AlternatesEntry {
    user_id: String,
    names: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProgressReport {
    stage: i32,
    progress: i64,
    running: bool,
    status: AttemptStatus,
}

impl From<&Channel> for ProgressReport {
    fn from(channel: &Channel) -> Self {
        Self {
            stage: channel.stage.as_i32(),
            progress: channel.progress,
            running: channel.running,
            status: channel.status(),
        }
    }
}

type AlternatesMap = BTreeMap<String, Vec<String>>;

pub(crate) async fn start(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    state.scheduler().spawn_advance(channel_id.clone());
    info!(channel_id = %channel_id, "advance scheduled");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            channel_id,
            status: "accepted",
        }),
    ))
}

pub(crate) async fn stop(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    state.scheduler().stop(&channel_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            channel_id,
            status: "stopping",
        }),
    ))
}

pub(crate) async fn get_stage(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<StageBody>, ControlError> {
    let channel = state.dao().ensure_channel(&channel_id).await?;
    Ok(Json(StageBody {
        stage: Some(i64::from(channel.stage.as_i32())),
    }))
}

pub(crate) async fn put_stage(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(body): Json<StageBody>,
) -> Result<Json<StageBody>, ControlError> {
    let raw = body
        .stage
        .ok_or_else(|| ControlError::BadRequest("stage is required".to_string()))?;
    let stage = i32::try_from(raw)
        .ok()
        .and_then(|value| Stage::try_from(value).ok())
        .ok_or_else(|| {
            ControlError::Unprocessable(format!("stage must be between 0 and 6, got {raw}"))
        })?;

    state.dao().ensure_channel(&channel_id).await?;
    if !state.dao().set_stage(&channel_id, stage).await? {
        return Err(ControlError::AttemptRunning(channel_id));
    }
    info!(channel_id = %channel_id, stage = %stage, "stage overridden");
    Ok(Json(StageBody { stage: Some(raw) }))
}

pub(crate) async fn get_limit(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<LimitBody>, ControlError> {
    let channel = state.dao().ensure_channel(&channel_id).await?;
    Ok(Json(LimitBody {
        limit: Some(channel.limit),
    }))
}

pub(crate) async fn put_limit(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(body): Json<LimitBody>,
) -> Result<Json<LimitBody>, ControlError> {
    let limit = body
        .limit
        .ok_or_else(|| ControlError::BadRequest("limit is required".to_string()))?;
    if limit <= 0 {
        return Err(ControlError::Unprocessable(format!(
            "limit must be positive, got {limit}"
        )));
    }

    state.dao().ensure_channel(&channel_id).await?;
    state.dao().set_limit(&channel_id, limit).await?;
    Ok(Json(LimitBody { limit: Some(limit) }))
}

pub(crate) async fn get_alternates(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<AlternatesMap>, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    Ok(Json(alternates_map(&state, &channel_id).await?))
}

pub(crate) async fn add_alternates(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(entries): Json<Vec<AlternatesEntry>>,
) -> Result<Json<AlternatesMap>, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    let alternates = flatten_alternates(&channel_id, entries);
    state.dao().add_alternates(&alternates).await?;
    Ok(Json(alternates_map(&state, &channel_id).await?))
}

pub(crate) async fn remove_alternates(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(entries): Json<Vec<AlternatesEntry>>,
) -> Result<Json<AlternatesMap>, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    let alternates = flatten_alternates(&channel_id, entries);
    state.dao().remove_alternates(&alternates).await?;
    Ok(Json(alternates_map(&state, &channel_id).await?))
}

pub(crate) async fn progress(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<ProgressReport>, ControlError> {
    let channel = state.dao().ensure_channel(&channel_id).await?;
    Ok(Json(ProgressReport::from(&channel)))
}

pub(crate) async fn message_sentiments(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<Vec<MessageSentiment>>, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    Ok(Json(state.dao().list_message_sentiments(&channel_id).await?))
}

pub(crate) async fn user_sentiments(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<Vec<UserSentiment>>, ControlError> {
    state.dao().ensure_channel(&channel_id).await?;
    Ok(Json(state.dao().list_user_sentiments(&channel_id).await?))
}

/// One row per distinct (user, trimmed non-empty name).
fn flatten_alternates(channel_id: &str, entries: Vec<AlternatesEntry>) -> Vec<UserAlternate> {
    let mut seen = BTreeSet::new();
    let mut alternates = Vec::new();
    for entry in entries {
        for name in entry.names {
            let name = name.trim();
            if name.is_empty() || !seen.insert((entry.user_id.clone(), name.to_string())) {
                continue;
            }
            alternates.push(UserAlternate {
                channel_id: channel_id.to_string(),
                user_id: entry.user_id.clone(),
                name: name.to_string(),
            });
        }
    }
    alternates
}

async fn alternates_map(state: &AppState, channel_id: &str) -> anyhow::Result<AlternatesMap> {
    let mut map = AlternatesMap::new();
    for alternate in state.dao().list_alternates(channel_id).await? {
        map.entry(alternate.user_id).or_default().push(alternate.name);
    }
    Ok(map)
}
