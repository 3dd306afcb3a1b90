//! Request encoding and reply decoding.

use thiserror::Error;
use tracing::debug;

use crate::{
    config::{Config, Coordinates},
    message::{Message, MessageError, Outbox, Value, keys},
    model::{
        ConditionCode, FORECAST_SIZE, Forecast, ForecastEntry, TEXT_BUFFER_SIZE, Temperature,
        WeatherInfo, truncate_text,
    },
};

/// Writes a fetch request for `config` into `outbox`.
///
/// Only the request marker is mandatory. Everything left at its default is
/// omitted so the request stays well inside the outbox.
pub fn encode_request(config: &Config, outbox: &mut Outbox) -> Result<(), MessageError> {
    outbox.write(keys::REQUEST, Value::U8(1))?;

    if !config.api_key.is_empty() {
        outbox.write(keys::API_KEY, Value::CString(config.api_key.clone()))?;
    }

    if let Some(provider) = config.provider {
        outbox.write(keys::PROVIDER, Value::I32(provider.code()))?;
    }

    // Fields are public, so a sentinel pair can still get here.
    if let Some(location) = config
        .location
        .and_then(|c| Coordinates::from_wire(c.latitude, c.longitude))
    {
        outbox.write(keys::LATITUDE, Value::I32(location.latitude))?;
        outbox.write(keys::LONGITUDE, Value::I32(location.longitude))?;
    }

    if config.feels_like {
        outbox.write(keys::FEELS_LIKE, Value::I8(1))?;
    }

    if config.forecast {
        outbox.write(keys::FORECAST, Value::I8(1))?;
    }

    debug!(
        tuples = outbox.message().len(),
        size = outbox.message().size(),
        "encoded weather request"
    );
    Ok(())
}

/// A successful weather payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherReply {
    pub description: String,
    pub name: String,
    pub temperature: Temperature,
    pub day: bool,
    pub condition: ConditionCode,
    pub sunrise: i64,
    pub sunset: i64,
    /// Location the companion resolved, if it sent one.
    pub location: Option<Coordinates>,
    /// Present only when forecasting was enabled for the decode.
    pub forecast: Option<Forecast>,
}

impl WeatherReply {
    /// Copies the reply into `info`, stamping it with `now`.
    pub fn apply_to(&self, info: &mut WeatherInfo, now: i64) {
        info.description = self.description.clone();
        info.name = self.name.clone();
        info.temperature = self.temperature;
        info.day = self.day;
        info.condition = self.condition;
        info.timestamp = now;
        info.sunrise = self.sunrise;
        info.sunset = self.sunset;
        if let Some(location) = self.location {
            info.latitude = location.latitude;
            info.longitude = location.longitude;
        }
    }
}

/// The shapes an inbound message can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Weather(Box<WeatherReply>),
    BadKey,
    LocationUnavailable,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reply is missing required field {0}")]
    MissingField(u32),
    #[error("reply field {0} has an unexpected type")]
    WrongType(u32),
}

/// Classifies and decodes an inbound message.
///
/// `Ok(None)` means the message is not meant for us. The reply marker wins
/// over the error markers when several are present.
pub fn decode_reply(message: &Message, forecast_enabled: bool) -> Result<Option<Reply>, DecodeError> {
    if message.contains(keys::REPLY) {
        let reply = decode_weather(message, forecast_enabled)?;
        debug!(
            name = %reply.name,
            temp_k = reply.temperature.kelvin,
            forecast = reply.forecast.as_ref().map(Forecast::len),
            "decoded weather reply"
        );
        return Ok(Some(Reply::Weather(Box::new(reply))));
    }

    if message.contains(keys::BAD_KEY) {
        debug!("companion rejected the api key");
        return Ok(Some(Reply::BadKey));
    }

    if message.contains(keys::LOCATION_UNAVAILABLE) {
        debug!("companion could not determine a location");
        return Ok(Some(Reply::LocationUnavailable));
    }

    Ok(None)
}

fn decode_weather(message: &Message, forecast_enabled: bool) -> Result<WeatherReply, DecodeError> {
    let description = required_str(message, keys::DESCRIPTION)?;
    let name = required_str(message, keys::NAME)?;
    let temp_k = required_int(message, keys::TEMP_K)?;

    let location = match (
        optional_int(message, keys::RESULT_LAT)?,
        optional_int(message, keys::RESULT_LONG)?,
    ) {
        (Some(latitude), Some(longitude)) => Coordinates::from_wire(latitude, longitude),
        _ => None,
    };

    Ok(WeatherReply {
        description: truncate_text(description, TEXT_BUFFER_SIZE),
        name: truncate_text(name, TEXT_BUFFER_SIZE),
        temperature: Temperature::from_kelvin(temp_k as i16),
        day: required_int(message, keys::DAY)? == 1,
        condition: ConditionCode::from_code(required_int(message, keys::CONDITION_CODE)?),
        sunrise: i64::from(required_int(message, keys::SUNRISE)?),
        sunset: i64::from(required_int(message, keys::SUNSET)?),
        location,
        forecast: forecast_enabled.then(|| decode_forecast(message)),
    })
}

/// Reads forecast slots until the first slot that is not fully present.
/// That slot and every later one stay zeroed.
fn decode_forecast(message: &Message) -> Forecast {
    let mut forecast = Forecast::default();

    for i in 0..FORECAST_SIZE {
        let offset = i as u32;
        let slot = (
            message
                .find(keys::FORECAST_CONDITION_CODE + offset)
                .and_then(Value::as_i32),
            message.find(keys::FORECAST_TIME + offset).and_then(Value::as_i32),
            message.find(keys::FORECAST_TEMP_K + offset).and_then(Value::as_i32),
        );

        let (Some(condition), Some(time), Some(temp_k)) = slot else {
            break;
        };

        if let Some(entry) = forecast.slot_mut(i) {
            *entry = ForecastEntry::new(
                i64::from(time),
                temp_k as i16,
                ConditionCode::from_code(condition),
            );
        }
        forecast.set_len(i + 1);
    }

    forecast
}

fn required_str(message: &Message, key: u32) -> Result<&str, DecodeError> {
    message
        .find(key)
        .ok_or(DecodeError::MissingField(key))?
        .as_str()
        .ok_or(DecodeError::WrongType(key))
}

fn required_int(message: &Message, key: u32) -> Result<i32, DecodeError> {
    optional_int(message, key)?.ok_or(DecodeError::MissingField(key))
}

fn optional_int(message: &Message, key: u32) -> Result<Option<i32>, DecodeError> {
    message
        .find(key)
        .map(|v| v.as_i32().ok_or(DecodeError::WrongType(key)))
        .transpose()
}
