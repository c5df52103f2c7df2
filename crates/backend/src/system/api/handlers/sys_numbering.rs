use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use contracts::system::sys_numbering::{
    CodeRequest, IssuedNumber, SequenceConfig, SequenceConfigPatch, SequenceKey, SequenceSnapshot,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::system::sys_numbering::{NumberingError, SequenceService};

pub type NumberingState = Arc<SequenceService>;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn status_for(error: &NumberingError) -> StatusCode {
    match error {
        NumberingError::Configuration(_) => StatusCode::BAD_REQUEST,
        NumberingError::NotFound(_) => StatusCode::NOT_FOUND,
        NumberingError::Disabled(_) | NumberingError::Exhausted { .. } => StatusCode::CONFLICT,
        NumberingError::Contended { .. } => StatusCode::SERVICE_UNAVAILABLE,
        NumberingError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: NumberingError) -> ApiError {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!("Numbering request failed: {}", error);
    } else {
        tracing::warn!("Numbering request rejected: {}", error);
    }
    (status, Json(json!({ "error": error.to_string() })))
}

fn parse_key(domain: String, key: String) -> Result<SequenceKey, ApiError> {
    SequenceKey::new(domain, key).map_err(|e| api_error(NumberingError::Configuration(e)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    #[serde(default = "default_preserve")]
    pub preserve_config: bool,
}

fn default_preserve() -> bool {
    true
}

/// GET /api/sys/numbering/sequences?domain=
pub async fn list(
    State(service): State<NumberingState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<SequenceConfig>> {
    service
        .list_configs(query.domain.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/sys/numbering/:domain/:key
pub async fn get_config(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
) -> ApiResult<SequenceConfig> {
    let key = parse_key(domain, key)?;
    match service.get_config(&key).await {
        Ok(Some(config)) => Ok(Json(config)),
        Ok(None) => Err(api_error(NumberingError::NotFound(key))),
        Err(e) => Err(api_error(e)),
    }
}

/// PUT /api/sys/numbering/:domain/:key
pub async fn update_config(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
    Json(patch): Json<SequenceConfigPatch>,
) -> ApiResult<SequenceConfig> {
    let key = parse_key(domain, key)?;
    service
        .update_config(&key, patch)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/sys/numbering/:domain/:key/generate
pub async fn generate(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
) -> ApiResult<IssuedNumber> {
    let key = parse_key(domain, key)?;
    service
        .generate_or_degraded(&key)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/sys/numbering/:domain/:key/preview
pub async fn preview(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
) -> ApiResult<Value> {
    let key = parse_key(domain, key)?;
    let code = service.preview_next(&key).await.map_err(api_error)?;
    Ok(Json(json!({ "code": code })))
}

/// POST /api/sys/numbering/:domain/:key/reserve
pub async fn reserve(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
    Json(req): Json<CodeRequest>,
) -> ApiResult<Value> {
    let key = parse_key(domain, key)?;
    let reserved = service
        .reserve_explicit(&key, &req.code)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "reserved": reserved })))
}

/// POST /api/sys/numbering/:domain/:key/release
pub async fn release(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
    Json(req): Json<CodeRequest>,
) -> ApiResult<Value> {
    let key = parse_key(domain, key)?;
    let released = service.release(&key, &req.code).await.map_err(api_error)?;
    Ok(Json(json!({ "released": released })))
}

/// POST /api/sys/numbering/:domain/:key/validate
pub async fn validate(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
    Json(req): Json<CodeRequest>,
) -> ApiResult<Value> {
    let key = parse_key(domain, key)?;
    let valid = service.validate(&key, &req.code).await.map_err(api_error)?;
    Ok(Json(json!({ "valid": valid })))
}

/// POST /api/sys/numbering/:domain/:key/reset?preserve_config=
pub async fn reset(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
    Query(query): Query<ResetQuery>,
) -> Result<StatusCode, ApiError> {
    let key = parse_key(domain, key)?;
    service
        .reset_sequence(&key, query.preserve_config)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::OK)
}

/// GET /api/sys/numbering/:domain/:key/snapshot
pub async fn export_snapshot(
    State(service): State<NumberingState>,
    Path((domain, key)): Path<(String, String)>,
) -> ApiResult<SequenceSnapshot> {
    let key = parse_key(domain, key)?;
    service
        .export_snapshot(&key)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/sys/numbering/snapshot
pub async fn import_snapshot(
    State(service): State<NumberingState>,
    Json(snapshot): Json<SequenceSnapshot>,
) -> ApiResult<SequenceKey> {
    service
        .import_snapshot(snapshot)
        .await
        .map(Json)
        .map_err(api_error)
}
