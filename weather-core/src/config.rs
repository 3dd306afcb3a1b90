use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::model::truncate_text;

/// Size of the api key buffer, terminator included.
pub const API_KEY_BUFFER_SIZE: usize = 33;

/// Weather source the companion should query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenWeatherMap,
    WeatherUnderground,
    ForecastIo,
    YahooWeather,
}

impl Provider {
    pub fn code(&self) -> i32 {
        match self {
            Provider::OpenWeatherMap => 0,
            Provider::WeatherUnderground => 1,
            Provider::ForecastIo => 2,
            Provider::YahooWeather => 3,
        }
    }

    /// `None` for the unknown sentinel and anything unrecognised.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Provider::OpenWeatherMap),
            1 => Some(Provider::WeatherUnderground),
            2 => Some(Provider::ForecastIo),
            3 => Some(Provider::YahooWeather),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenWeatherMap => "openweathermap",
            Provider::WeatherUnderground => "weatherunderground",
            Provider::ForecastIo => "forecastio",
            Provider::YahooWeather => "yahooweather",
        }
    }

    pub const fn all() -> &'static [Provider] {
        &[
            Provider::OpenWeatherMap,
            Provider::WeatherUnderground,
            Provider::ForecastIo,
            Provider::YahooWeather,
        ]
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Provider {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();
        Provider::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| {
                anyhow!(
                    "Unknown provider '{value}'. Supported providers: openweathermap, weatherunderground, forecastio, yahooweather."
                )
            })
    }
}

/// Fixed-point coordinates, degrees ×100000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: i32,
    pub longitude: i32,
}

impl Coordinates {
    /// Wire value of either component meaning "use the companion's GPS".
    pub const GPS_SENTINEL: i32 = -1;

    pub fn new(latitude: i32, longitude: i32) -> Self {
        Self { latitude, longitude }
    }

    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: (latitude * 100_000.0).round() as i32,
            longitude: (longitude * 100_000.0).round() as i32,
        }
    }

    /// Maps a pair with a sentinel component to `None`.
    pub fn from_wire(latitude: i32, longitude: i32) -> Option<Self> {
        if latitude == Self::GPS_SENTINEL || longitude == Self::GPS_SENTINEL {
            None
        } else {
            Some(Self::new(latitude, longitude))
        }
    }
}

/// Parameters sent with every fetch request.
///
/// Example TOML:
/// ```toml
/// api_key = "..."
/// provider = "openweathermap"
/// feels_like = false
/// forecast = true
///
/// [location]
/// latitude = 4212345
/// longitude = -1235478
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Empty means the companion uses its own key.
    #[serde(default)]
    pub api_key: String,
    /// `None` lets the companion pick its default provider.
    pub provider: Option<Provider>,
    #[serde(default)]
    pub feels_like: bool,
    #[serde(default)]
    pub forecast: bool,
    /// `None` means the companion's GPS location.
    pub location: Option<Coordinates>,
}

impl Config {
    /// `None` clears the key.
    pub fn set_api_key(&mut self, api_key: Option<&str>) {
        self.api_key = api_key
            .map(|key| truncate_text(key, API_KEY_BUFFER_SIZE))
            .unwrap_or_default();
    }

    pub fn set_provider(&mut self, provider: Option<Provider>) {
        self.provider = provider;
    }

    /// A pair with a `GPS_SENTINEL` component means the companion's GPS,
    /// the same as `None`.
    pub fn set_location(&mut self, location: Option<Coordinates>) {
        self.location = location.and_then(|c| Coordinates::from_wire(c.latitude, c.longitude));
    }

    pub fn set_feels_like(&mut self, feels_like: bool) {
        self.feels_like = feels_like;
    }

    pub fn set_forecast(&mut self, forecast: bool) {
        self.forecast = forecast;
    }

    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        // Hand-edited files may carry an overlong key or a sentinel location.
        let key = cfg.api_key.clone();
        cfg.set_api_key(Some(&key));
        cfg.set_location(cfg.location);

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    pub fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "companion-weather", "weather")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }
}
