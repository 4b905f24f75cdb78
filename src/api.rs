use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::AcquireError;
use crate::types::{parse_level, AppState, DatasetKey, Variable};
use crate::walker::current_slot;

const DOWNLOAD_USAGE: &str = "Wrong parameters of the GET request. Call this endpoint with following parameters: ?date=[YYYYMMDD]&time=[XXXX]&level=[XX]";

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    date: Option<String>,
    time: Option<String>,
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CurrentQuery {
    #[serde(default)]
    fresh: bool,
}

/// Parts of a `{slot}-{variable}-isobaric-{level}hPa-gfs-1.0.json` file name.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CacheFileName {
    pub slot: String,
    pub variable: String,
    pub level: String,
}

pub(crate) fn parse_file_name(file: &str) -> Result<CacheFileName, AcquireError> {
    let regex = Regex::new(r"^(\d{2,4})-([a-z_]+)-isobaric-(\d+)(?:hPa)?-gfs-1\.0\.json$")
        .map_err(|error| AcquireError::InvalidKey(error.to_string()))?;
    let captures = regex
        .captures(file)
        .ok_or_else(|| AcquireError::InvalidKey(format!("unrecognised data file name '{file}'")))?;
    Ok(CacheFileName {
        slot: captures[1].to_string(),
        variable: captures[2].to_string(),
        level: captures[3].to_string(),
    })
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Single attempt for an explicit wind dataset.
pub async fn download(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> Response {
    let (Some(date), Some(time), Some(level)) = (query.date, query.time, query.level) else {
        return (StatusCode::BAD_REQUEST, DOWNLOAD_USAGE).into_response();
    };
    let key = match DatasetKey::parse(&date, &time, &level, Variable::Wind.name()) {
        Ok(key) => key,
        Err(error) => return error_response(error),
    };
    respond(state.engine.acquire_explicit(key).await)
}

/// Latest available data for the level/variable named by `file`.
pub async fn current_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<CurrentQuery>,
) -> Response {
    let now = Utc::now();
    let key = match current_key(&file, now) {
        Ok(key) => key,
        Err(error) => return error_response(error),
    };

    if query.fresh {
        respond(state.engine.acquire_current_fresh(key, now).await)
    } else {
        respond(state.engine.acquire_current(key).await)
    }
}

pub async fn dated_file(
    State(state): State<AppState>,
    Path((year, month, day, file)): Path<(String, String, String, String)>,
) -> Response {
    if !within(&month, 12) || !within(&day, 31) {
        return (
            StatusCode::BAD_REQUEST,
            "Bad request. Day or month out of bounds.",
        )
            .into_response();
    }

    let key = match parse_file_name(&file).and_then(|parts| {
        DatasetKey::parse(
            &format!("{year}{month}{day}"),
            &parts.slot,
            &parts.level,
            &parts.variable,
        )
    }) {
        Ok(key) => key,
        Err(error) => return error_response(error),
    };

    respond(state.engine.acquire(key, Utc::now()).await)
}

fn current_key(file: &str, now: chrono::DateTime<Utc>) -> Result<DatasetKey, AcquireError> {
    let parts = parse_file_name(file)?;
    let variable = parts.variable.parse::<Variable>()?;
    let level = parse_level(&parts.level)?;
    let (date, slot) = current_slot(now);
    Ok(DatasetKey::new(date, slot, level, variable))
}

fn within(value: &str, max: u32) -> bool {
    matches!(value.parse::<u32>(), Ok(number) if (1..=max).contains(&number))
}

fn respond(result: Result<Vec<u8>, AcquireError>) -> Response {
    match result {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            bytes,
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

fn error_response(error: AcquireError) -> Response {
    let status = error.status();
    if status.is_server_error() {
        warn!("Acquisition failed: {error}");
    } else {
        info!("Request rejected ({status}): {error}");
    }
    (status, error.to_string()).into_response()
}
