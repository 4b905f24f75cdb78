use std::path::{Path, PathBuf};

use chrono::Datelike;

use crate::constants::{
    CACHE_FILE_SUFFIX, FORECAST_HOUR_WIDTH, JSON_EXTENSION, PRESSURE_UNIT, RAW_EXTENSION,
};
use crate::types::{DatasetKey, Variable};

/// One GET against the archive's filter endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub endpoint: String,
    pub file: String,
    pub level_filter: String,
    pub variable_filters: Vec<&'static str>,
    pub dir: String,
}

impl RemoteDescriptor {
    pub fn url(&self) -> String {
        let mut url = format!(
            "{}?file={}&{}=on",
            self.endpoint, self.file, self.level_filter
        );
        for field in &self.variable_filters {
            url.push_str("&var_");
            url.push_str(field);
            url.push_str("=on");
        }
        url.push_str("&dir=");
        url.push_str(&urlencoding::encode(&self.dir));
        url
    }
}

/// Archive field codes for a fetchable variable. Wind requests both components together.
pub fn remote_fields(variable: Variable) -> &'static [&'static str] {
    match variable {
        Variable::Temp | Variable::AirDensity => &["TMP"],
        Variable::Vvel => &["VVEL"],
        Variable::Dzdt => &["DZDT"],
        Variable::Hgt => &["HGT"],
        Variable::Wind => &["UGRD", "VGRD"],
    }
}

pub fn file_name(slot_hhmm: &str, variable: Variable, level: u32) -> String {
    format!(
        "{slot_hhmm}-{variable}-isobaric-{level}{PRESSURE_UNIT}-{CACHE_FILE_SUFFIX}.{JSON_EXTENSION}"
    )
}

/// `{root}/{YYYY}/{MM}/{DD}/{slot}-{variable}-isobaric-{level}hPa-gfs-1.0.json`
pub fn resolve_path(weather_dir: &Path, key: &DatasetKey) -> PathBuf {
    weather_dir
        .join(format!("{:04}", key.date.year()))
        .join(format!("{:02}", key.date.month()))
        .join(format!("{:02}", key.date.day()))
        .join(file_name(&key.slot.hhmm(), key.variable, key.level))
}

/// Pre-conversion artifact sharing the JSON entry's stem.
pub fn raw_path(json_path: &Path) -> PathBuf {
    json_path.with_extension(RAW_EXTENSION)
}

pub fn resolve_remote_descriptor(endpoint: &str, key: &DatasetKey) -> RemoteDescriptor {
    let cycle = key.slot.cycle();
    RemoteDescriptor {
        endpoint: endpoint.to_string(),
        file: format!(
            "gfs.t{cycle}z.pgrb2.0p25.f{:0width$}",
            key.forecast_hour,
            width = FORECAST_HOUR_WIDTH
        ),
        level_filter: format!("lev_{}_mb", key.level),
        variable_filters: remote_fields(key.variable).to_vec(),
        dir: format!("/gfs.{}/{cycle}/atmos", key.date_string()),
    }
}
