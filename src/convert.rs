use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::constants::{AIR_DENSITY_CONSTANT, JSON_EXTENSION};
use crate::error::AcquireError;
use crate::types::PostProcess;

#[async_trait]
pub trait Converter: Send + Sync {
    /// Converts a downloaded GRIB2 file and returns the JSON payload, which is
    /// also left next to the raw file with a `.json` extension.
    async fn convert(&self, raw: &Path) -> Result<Vec<u8>, AcquireError>;
}

/// Runs the external `grib2json` tool: `grib2json -n -d -o <out> <in>`.
pub struct Grib2Json {
    binary: PathBuf,
}

impl Grib2Json {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

pub fn json_path(raw: &Path) -> PathBuf {
    raw.with_extension(JSON_EXTENSION)
}

#[async_trait]
impl Converter for Grib2Json {
    async fn convert(&self, raw: &Path) -> Result<Vec<u8>, AcquireError> {
        let out = json_path(raw);
        let staging = raw.with_extension("json.part");
        debug!("Converting {} with {}", raw.display(), self.binary.display());

        let output = Command::new(&self.binary)
            .arg("-n")
            .arg("-d")
            .arg("-o")
            .arg(&staging)
            .arg(raw)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| {
                AcquireError::ConversionFailed(format!(
                    "failed to run {}: {error}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let _ = fs::remove_file(&staging).await;
            return Err(AcquireError::ConversionFailed(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let bytes = fs::read(&staging).await.map_err(|error| {
            AcquireError::ConversionFailed(format!("reading {}: {error}", staging.display()))
        })?;
        fs::rename(&staging, &out)
            .await
            .map_err(|error| AcquireError::io(format_args!("rename {}", staging.display()), error))?;
        info!("Converted {} ({} bytes)", out.display(), bytes.len());
        Ok(bytes)
    }
}

pub fn apply(post: PostProcess, payload: &[u8], level: u32) -> Result<Vec<u8>, AcquireError> {
    match post {
        PostProcess::AirDensity => derive_air_density(payload, level),
    }
}

/// Replaces every temperature `t` (K) of the first record's data array with
/// `0.348432 * level / t`, giving air density in kg/m^3.
pub fn derive_air_density(payload: &[u8], level: u32) -> Result<Vec<u8>, AcquireError> {
    let mut document: Value = serde_json::from_slice(payload)
        .map_err(|error| AcquireError::DerivationFailed(format!("invalid JSON: {error}")))?;

    let data = document
        .get_mut(0)
        .and_then(|record| record.get_mut("data"))
        .and_then(Value::as_array_mut)
        .ok_or_else(|| AcquireError::DerivationFailed("missing data array".to_string()))?;

    for (idx, value) in data.iter_mut().enumerate() {
        let temperature = value.as_f64().ok_or_else(|| {
            AcquireError::DerivationFailed(format!("non-numeric value at index {idx}"))
        })?;
        let density = AIR_DENSITY_CONSTANT * level as f64 / temperature;
        if !density.is_finite() {
            return Err(AcquireError::DerivationFailed(format!(
                "temperature {temperature} at index {idx} has no finite density"
            )));
        }
        *value = serde_json::json!(density);
    }

    serde_json::to_vec(&document)
        .map_err(|error| AcquireError::DerivationFailed(format!("encode: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_of(payload: &[u8]) -> Vec<f64> {
        let value: Value = serde_json::from_slice(payload).unwrap();
        value[0]["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect()
    }

    #[test]
    fn air_density_at_500_hpa() {
        let out = derive_air_density(br#"[{"header":{},"data":[250.0]}]"#, 500).unwrap();
        let data = data_of(&out);
        assert_eq!(data.len(), 1);
        assert!((data[0] - 0.696864).abs() < 1e-12);
    }

    #[test]
    fn header_survives_derivation() {
        let out =
            derive_air_density(br#"[{"header":{"refTime":"x"},"data":[300, 200.0]}]"#, 850).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value[0]["header"]["refTime"], "x");
        assert_eq!(data_of(&out).len(), 2);
    }

    #[test]
    fn zero_temperature_is_an_error() {
        let result = derive_air_density(br#"[{"header":{},"data":[250.0, 0.0]}]"#, 500);
        assert!(matches!(result, Err(AcquireError::DerivationFailed(_))));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for payload in [
            &br#"[{"header":{}}]"#[..],
            br#"[{"data":"250"}]"#,
            br#"[{"data":[250.0, null]}]"#,
            br#"{"data":[250.0]}"#,
            b"garbage",
        ] {
            assert!(matches!(
                derive_air_density(payload, 500),
                Err(AcquireError::DerivationFailed(_))
            ));
        }
    }

    #[tokio::test]
    async fn missing_converter_binary_fails_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("0000-temp-isobaric-500hPa-gfs-1.0.f000");
        std::fs::write(&raw, b"GRIB").unwrap();
        let converter = Grib2Json::new(dir.path().join("no-such-grib2json"));
        let result = converter.convert(&raw).await;
        assert!(matches!(result, Err(AcquireError::ConversionFailed(_))));
        assert!(!json_path(&raw).exists());
    }
}
