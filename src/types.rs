use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::engine::Engine;
use crate::error::AcquireError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// One of the four daily synoptic analysis times.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    H00,
    H06,
    H12,
    H18,
}

impl Slot {
    #[cfg(test)]
    pub const ALL: [Slot; 4] = [Slot::H00, Slot::H06, Slot::H12, Slot::H18];

    pub fn hour(self) -> u32 {
        match self {
            Slot::H00 => 0,
            Slot::H06 => 6,
            Slot::H12 => 12,
            Slot::H18 => 18,
        }
    }

    /// Slot whose 6-hour window contains `hour`.
    pub fn containing_hour(hour: u32) -> Self {
        match hour {
            0..=5 => Slot::H00,
            6..=11 => Slot::H06,
            12..=17 => Slot::H12,
            _ => Slot::H18,
        }
    }

    /// Two-digit cycle hour, as used in archive file names (`gfs.t06z...`).
    pub fn cycle(self) -> String {
        format!("{:02}", self.hour())
    }

    /// Four-digit form used in cache file names (`0600-...`).
    pub fn hhmm(self) -> String {
        format!("{:02}00", self.hour())
    }
}

impl FromStr for Slot {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "0000" | "00" => Ok(Slot::H00),
            "0600" | "06" => Ok(Slot::H06),
            "1200" | "12" => Ok(Slot::H12),
            "1800" | "18" => Ok(Slot::H18),
            other => Err(AcquireError::InvalidKey(format!(
                "time must be one of 0000/0600/1200/1800, got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hhmm())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variable {
    Wind,
    Temp,
    AirDensity,
    Vvel,
    Dzdt,
    Hgt,
}

/// Payload transformation applied after conversion of a derived variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostProcess {
    AirDensity,
}

impl Variable {
    pub fn name(self) -> &'static str {
        match self {
            Variable::Wind => "wind",
            Variable::Temp => "temp",
            Variable::AirDensity => "air_density",
            Variable::Vvel => "vvel",
            Variable::Dzdt => "dzdt",
            Variable::Hgt => "hgt",
        }
    }

    /// Variable actually fetched from the archive, plus the transformation
    /// that turns its payload into this one.
    pub fn derivation(self) -> (Variable, Option<PostProcess>) {
        match self {
            Variable::AirDensity => (Variable::Temp, Some(PostProcess::AirDensity)),
            other => (other, None),
        }
    }
}

impl FromStr for Variable {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "wind" => Ok(Variable::Wind),
            "temp" => Ok(Variable::Temp),
            "air_density" => Ok(Variable::AirDensity),
            "vvel" => Ok(Variable::Vvel),
            "dzdt" => Ok(Variable::Dzdt),
            "hgt" => Ok(Variable::Hgt),
            other => Err(AcquireError::InvalidVariable(other.to_string())),
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DatasetKey {
    pub date: NaiveDate,
    pub slot: Slot,
    /// Pressure level in hPa.
    pub level: u32,
    pub variable: Variable,
    pub forecast_hour: u32,
}

impl DatasetKey {
    pub fn new(date: NaiveDate, slot: Slot, level: u32, variable: Variable) -> Self {
        Self {
            date,
            slot,
            level,
            variable,
            forecast_hour: 0,
        }
    }

    /// Validates raw caller input before any I/O happens.
    pub fn parse(date: &str, time: &str, level: &str, variable: &str) -> Result<Self, AcquireError> {
        let variable = variable.parse::<Variable>()?;
        let date = parse_date(date)?;
        let slot = time.parse::<Slot>()?;
        let level = parse_level(level)?;
        Ok(Self::new(date, slot, level, variable))
    }

    pub fn with_forecast_hour(self, forecast_hour: u32) -> Self {
        Self {
            forecast_hour,
            ..self
        }
    }

    pub fn at(self, date: NaiveDate, slot: Slot) -> Self {
        Self { date, slot, ..self }
    }

    /// Same key, addressing the variable that is physically downloaded.
    pub fn fetch_key(self) -> Self {
        Self {
            variable: self.variable.derivation().0,
            ..self
        }
    }

    pub fn date_string(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}hPa/{}/f{:03}",
            self.date_string(),
            self.slot,
            self.level,
            self.variable,
            self.forecast_hour
        )
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, AcquireError> {
    if value.len() != 8 || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(AcquireError::InvalidKey(format!(
            "date must be an 8-digit YYYYMMDD string, got '{value}'"
        )));
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|_| AcquireError::InvalidKey(format!("'{value}' is not a calendar date")))
}

pub fn parse_level(value: &str) -> Result<u32, AcquireError> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_suffix("hPa").unwrap_or(trimmed);
    match trimmed.parse::<u32>() {
        Ok(level) if level > 0 => Ok(level),
        _ => Err(AcquireError::InvalidKey(format!(
            "level must be a positive integer, got '{value}'"
        ))),
    }
}
