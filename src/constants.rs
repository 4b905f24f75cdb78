pub const NOMADS_FILTER_URL: &str = "https://nomads.ncep.noaa.gov/cgi-bin/filter_gfs_0p25.pl";
pub const WEATHER_DIR: &str = "weather";
pub const CACHE_FILE_SUFFIX: &str = "gfs-1.0";
pub const JSON_EXTENSION: &str = "json";
pub const RAW_EXTENSION: &str = "f000";
pub const PART_EXTENSION: &str = "part";
pub const PRESSURE_UNIT: &str = "hPa";

pub const FORECAST_HOUR_WIDTH: usize = 3;

/// kg/m^3 per (hPa / K), i.e. 100 / R_dry with R_dry = 287.0
pub const AIR_DENSITY_CONSTANT: f64 = 0.348432;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_STATIC_DIR: &str = "public";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_CONVERTER_PATH: &str = "./utils/grib2json";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_CURRENT_TRIES: u32 = 5;
pub const DEFAULT_FORECAST_BASE_TRIES: u32 = 5;
pub const DEFAULT_FORECAST_HOUR_TRIES: u32 = 6;
pub const DEFAULT_MAX_AGE_HOURS: u64 = 6;

pub const STATIC_CACHE_CONTROL: &str = "public, max-age=300";
pub const USER_AGENT: &str = "earth-gfs-server/0.1";
