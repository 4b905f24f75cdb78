use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs;
use tracing::{info, warn};

use crate::error::AcquireError;

pub async fn read_entry(path: &Path) -> Result<Option<Vec<u8>>, AcquireError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(AcquireError::io(
            format_args!("read {}", path.display()),
            error,
        )),
    }
}

pub async fn remove_entry(path: &Path) -> Result<(), AcquireError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(AcquireError::io(
            format_args!("remove {}", path.display()),
            error,
        )),
    }
}

/// Reference time of a converter payload (`[0].header.refTime`).
pub fn reference_time(payload: &[u8]) -> Option<DateTime<Utc>> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let ref_time = value.get(0)?.get("header")?.get("refTime")?.as_str()?;
    DateTime::parse_from_rfc3339(ref_time)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn is_fresh(payload: &[u8], now: DateTime<Utc>, max_age: Duration) -> bool {
    let Some(ref_time) = reference_time(payload) else {
        return false;
    };
    let age = (now - ref_time).num_seconds().unsigned_abs();
    age < max_age.as_secs()
}

pub async fn persist_atomic(path: &Path, bytes: &[u8]) -> Result<(), AcquireError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|error| AcquireError::io(format_args!("create {}", parent.display()), error))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)
        .await
        .map_err(|error| AcquireError::io(format_args!("write {}", tmp_path.display()), error))?;
    if let Err(error) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(AcquireError::io(
            format_args!("rename {} -> {}", tmp_path.display(), path.display()),
            error,
        ));
    }
    Ok(())
}

pub async fn clean_weather_dir(weather_dir: &Path) {
    match fs::remove_dir_all(weather_dir).await {
        Ok(()) => info!("Removed cached weather data in {}", weather_dir.display()),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!(
            "Failed cleaning weather data in {}: {error}",
            weather_dir.display()
        ),
    }
}
