use serde::{Deserialize, Serialize};

/// Size of the text buffers in [`WeatherInfo`], terminator included.
pub const TEXT_BUFFER_SIZE: usize = 32;

/// Number of forecast slots carried by a reply.
pub const FORECAST_SIZE: usize = 24;

/// Kelvin offset used for the integer unit conversions.
const KELVIN_OFFSET: i32 = 273;

/// Fetch lifecycle status of a [`crate::WeatherSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No fetch has been attempted yet.
    #[default]
    NotYetFetched,
    /// The companion link was down when the fetch was attempted.
    BluetoothDisconnected,
    /// Request sent, waiting for the companion's reply.
    Pending,
    /// The request could not be sent, the reply was malformed, or it never came.
    Failed,
    /// Weather data has been received.
    Available,
    /// The companion reported that the api key was rejected.
    BadKey,
    /// The companion could not determine a location.
    LocationUnavailable,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotYetFetched => "not yet fetched",
            Status::BluetoothDisconnected => "bluetooth disconnected",
            Status::Pending => "pending",
            Status::Failed => "failed",
            Status::Available => "available",
            Status::BadKey => "bad api key",
            Status::LocationUnavailable => "location unavailable",
        }
    }

    /// True for every status a fetch can end in.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::NotYetFetched | Status::Pending)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weather condition categories shared by every provider.
///
/// The companion maps provider-specific icons/codes onto this set and sends
/// the numeric value. Codes this side does not know decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionCode {
    #[default]
    ClearSky,
    FewClouds,
    ScatteredClouds,
    BrokenClouds,
    ShowerRain,
    Rain,
    Thunderstorm,
    Snow,
    Mist,
    Wind,
    Unknown,
}

impl ConditionCode {
    pub const UNKNOWN_CODE: i32 = 1000;

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::ClearSky,
            1 => Self::FewClouds,
            2 => Self::ScatteredClouds,
            3 => Self::BrokenClouds,
            4 => Self::ShowerRain,
            5 => Self::Rain,
            6 => Self::Thunderstorm,
            7 => Self::Snow,
            8 => Self::Mist,
            9 => Self::Wind,
            _ => Self::Unknown,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::ClearSky => 0,
            Self::FewClouds => 1,
            Self::ScatteredClouds => 2,
            Self::BrokenClouds => 3,
            Self::ShowerRain => 4,
            Self::Rain => 5,
            Self::Thunderstorm => 6,
            Self::Snow => 7,
            Self::Mist => 8,
            Self::Wind => 9,
            Self::Unknown => Self::UNKNOWN_CODE,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ClearSky => "Clear sky",
            Self::FewClouds => "Few clouds",
            Self::ScatteredClouds => "Scattered clouds",
            Self::BrokenClouds => "Broken clouds",
            Self::ShowerRain => "Shower rain",
            Self::Rain => "Rain",
            Self::Thunderstorm => "Thunderstorm",
            Self::Snow => "Snow",
            Self::Mist => "Mist",
            Self::Wind => "Wind",
            Self::Unknown => "Unknown",
        }
    }
}

/// A temperature kept in Kelvin with Celsius and Fahrenheit derived from it.
///
/// All three values are integers; the conversions truncate toward zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Temperature {
    pub kelvin: i16,
    pub celsius: i16,
    pub fahrenheit: i16,
}

impl Temperature {
    pub fn from_kelvin(kelvin: i16) -> Self {
        let celsius = i32::from(kelvin) - KELVIN_OFFSET;
        let fahrenheit = (celsius * 9) / 5 + 32;
        Self {
            kelvin,
            celsius: celsius as i16,
            fahrenheit: fahrenheit as i16,
        }
    }
}

/// Current conditions as last reported by the companion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeatherInfo {
    /// Conditions text, e.g. "Sky is clear". At most 31 bytes.
    pub description: String,
    /// Name of the location from the weather feed. At most 31 bytes.
    pub name: String,
    pub temperature: Temperature,
    /// Day or night at the location.
    pub day: bool,
    pub condition: ConditionCode,
    /// When the reply was decoded, seconds since the epoch.
    pub timestamp: i64,
    /// Sunrise, seconds since the epoch (UTC).
    pub sunrise: i64,
    /// Sunset, seconds since the epoch (UTC).
    pub sunset: i64,
    /// Latitude of the reported location ×100000 (42.123456 -> 4212345).
    pub latitude: i32,
    /// Longitude of the reported location ×100000 (-12.354789 -> -1235478).
    pub longitude: i32,
}

/// One forecast slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForecastEntry {
    pub timestamp: i64,
    pub temperature: Temperature,
    pub condition: ConditionCode,
}

impl ForecastEntry {
    pub fn new(timestamp: i64, temp_kelvin: i16, condition: ConditionCode) -> Self {
        Self {
            timestamp,
            temperature: Temperature::from_kelvin(temp_kelvin),
            condition,
        }
    }

    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }
}

/// Fixed-capacity forecast buffer plus the number of valid leading slots.
///
/// A decode zeroes every slot at or past `len()`. Error replies only reset
/// the count, so those slots may hold stale data afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Forecast {
    entries: [ForecastEntry; FORECAST_SIZE],
    len: usize,
}

impl Forecast {
    /// Builds a forecast from leading entries; anything past
    /// `FORECAST_SIZE` is dropped.
    #[cfg(test)]
    pub(crate) fn from_entries(leading: &[ForecastEntry]) -> Self {
        let mut forecast = Self::default();
        let len = leading.len().min(FORECAST_SIZE);
        forecast.entries[..len].copy_from_slice(&leading[..len]);
        forecast.len = len;
        forecast
    }

    pub fn entries(&self) -> &[ForecastEntry; FORECAST_SIZE] {
        &self.entries
    }

    /// The valid leading slots.
    pub fn valid(&self) -> &[ForecastEntry] {
        &self.entries[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(FORECAST_SIZE);
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut ForecastEntry> {
        self.entries.get_mut(index)
    }
}

/// Borrowed view of a session's data, as returned by `peek`.
#[derive(Debug, Clone, Copy)]
pub struct PeekData<'a> {
    pub info: &'a WeatherInfo,
    pub forecast: &'a [ForecastEntry; FORECAST_SIZE],
    pub forecast_len: usize,
    pub status: Status,
}

/// Truncates `text` so that it fits a C-style buffer of `buffer_size` bytes
/// (terminator included), never splitting a UTF-8 sequence.
pub fn truncate_text(text: &str, buffer_size: usize) -> String {
    let max = buffer_size.saturating_sub(1);
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
