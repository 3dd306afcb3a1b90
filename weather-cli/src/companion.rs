//! A simulated companion that answers fetch requests with canned weather.

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use tokio::sync::mpsc;
use tracing::debug;

use weather_core::{
    ConditionCode, Coordinates, FORECAST_SIZE, Inbound, Message, Provider, Value,
    message::keys,
};

/// Answers requests coming from the device.
#[async_trait]
pub trait Companion: Send + Sync + Debug {
    /// `None` means the companion stays silent.
    async fn handle(&self, request: &Message) -> Option<Message>;
}

/// How the simulated companion behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Simulation {
    /// Reply with weather data.
    #[default]
    Ok,
    /// Reject the api key.
    BadKey,
    /// Fail to get a GPS fix (a configured location still works).
    NoLocation,
    /// Never reply.
    Silent,
    /// Report the link as down before anything is sent.
    Disconnected,
}

/// One observation as a provider would report it.
#[derive(Debug, Clone)]
struct Observation {
    name: &'static str,
    description: &'static str,
    /// OpenWeatherMap icon number, e.g. 10 for "10d".
    icon: u8,
    temp_c: f64,
    feels_like_c: f64,
}

#[derive(Debug, Clone)]
pub struct SimulatedCompanion {
    mode: Simulation,
    now: DateTime<Utc>,
    gps_fix: Coordinates,
}

impl SimulatedCompanion {
    pub fn new(mode: Simulation) -> Self {
        Self::at(mode, Utc::now())
    }

    pub fn at(mode: Simulation, now: DateTime<Utc>) -> Self {
        Self {
            mode,
            now,
            gps_fix: Coordinates::from_degrees(45.764, 4.8357),
        }
    }

    fn observation(&self) -> Observation {
        Observation {
            name: "Lyon",
            description: "light rain",
            icon: 10,
            temp_c: 11.3,
            feels_like_c: 9.8,
        }
    }

    fn weather_reply(&self, request: &Message, location: Coordinates) -> Message {
        let feels_like = request.contains(keys::FEELS_LIKE);
        let obs = self.observation();
        let temp = if feels_like { obs.feels_like_c } else { obs.temp_c };

        let sunrise = self.now - Duration::hours(5);
        let sunset = self.now + Duration::hours(6);
        let day = self.now > sunrise && self.now < sunset;

        let mut reply = Message::new()
            .with(keys::REPLY, Value::U8(1))
            .with(keys::TEMP_K, Value::I32(to_kelvin(temp)))
            .with(keys::NAME, Value::CString(obs.name.into()))
            .with(keys::DESCRIPTION, Value::CString(obs.description.into()))
            .with(keys::DAY, Value::I16(i16::from(day)))
            .with(keys::CONDITION_CODE, Value::I32(condition_from_icon(obs.icon).code()))
            .with(keys::SUNRISE, Value::I32(sunrise.timestamp() as i32))
            .with(keys::SUNSET, Value::I32(sunset.timestamp() as i32))
            .with(keys::RESULT_LAT, Value::I32(location.latitude))
            .with(keys::RESULT_LONG, Value::I32(location.longitude));

        if request.contains(keys::FORECAST) {
            // Hourly data, every second hour kept, like the hourly providers.
            let hourly = (0..FORECAST_SIZE * 2).map(|h| {
                let time = self.now + Duration::hours(h as i64 + 1);
                let temp_c = temp - 0.4 * h as f64;
                let icon = if h % 6 < 3 { 10 } else { 4 };
                (time, temp_c, condition_from_icon(icon))
            });

            for (slot, (time, temp_c, condition)) in hourly.skip(1).step_by(2).enumerate() {
                let offset = slot as u32;
                reply.insert(
                    keys::FORECAST_TEMP_K + offset,
                    Value::I32(to_kelvin(temp_c)),
                );
                reply.insert(keys::FORECAST_TIME + offset, Value::I32(time.timestamp() as i32));
                reply.insert(
                    keys::FORECAST_CONDITION_CODE + offset,
                    Value::I32(condition.code()),
                );
            }
        }

        reply
    }
}

#[async_trait]
impl Companion for SimulatedCompanion {
    async fn handle(&self, request: &Message) -> Option<Message> {
        if !request.contains(keys::REQUEST) {
            return None;
        }

        let provider = request
            .find(keys::PROVIDER)
            .and_then(Value::as_i32)
            .and_then(Provider::from_code)
            .unwrap_or(Provider::OpenWeatherMap);
        debug!(%provider, mode = ?self.mode, "companion got a fetch request");

        let requested = match (
            request.find(keys::LATITUDE).and_then(Value::as_i32),
            request.find(keys::LONGITUDE).and_then(Value::as_i32),
        ) {
            (Some(lat), Some(lon)) => Coordinates::from_wire(lat, lon),
            _ => None,
        };

        match self.mode {
            Simulation::Silent | Simulation::Disconnected => None,
            Simulation::BadKey => Some(Message::new().with(keys::BAD_KEY, Value::U8(1))),
            Simulation::NoLocation if requested.is_none() => {
                Some(Message::new().with(keys::LOCATION_UNAVAILABLE, Value::U8(1)))
            }
            Simulation::Ok | Simulation::NoLocation => {
                Some(self.weather_reply(request, requested.unwrap_or(self.gps_fix)))
            }
        }
    }
}

/// Serves requests until the device side hangs up.
pub async fn serve(
    companion: impl Companion,
    mut requests: mpsc::UnboundedReceiver<Message>,
    replies: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(request) = requests.recv().await {
        let Some(reply) = companion.handle(&request).await else {
            continue;
        };
        if replies.send(Inbound::Received(reply)).is_err() {
            break;
        }
    }
}

fn to_kelvin(celsius: f64) -> i32 {
    (celsius + 273.15).round() as i32
}

/// Maps an OpenWeatherMap icon number onto the shared condition set.
fn condition_from_icon(icon: u8) -> ConditionCode {
    match icon {
        1 => ConditionCode::ClearSky,
        2 => ConditionCode::FewClouds,
        3 => ConditionCode::ScatteredClouds,
        4 => ConditionCode::BrokenClouds,
        9 => ConditionCode::ShowerRain,
        10 => ConditionCode::Rain,
        11 => ConditionCode::Thunderstorm,
        13 => ConditionCode::Snow,
        50 => ConditionCode::Mist,
        _ => ConditionCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Message::new().with(keys::REQUEST, Value::U8(1))
    }

    #[tokio::test]
    async fn ok_reply_carries_weather_and_gps_fix() {
        let companion = SimulatedCompanion::new(Simulation::Ok);
        let reply = companion.handle(&request()).await.expect("reply");

        assert!(reply.contains(keys::REPLY));
        assert_eq!(reply.find(keys::TEMP_K), Some(&Value::I32(284)));
        assert_eq!(reply.find(keys::CONDITION_CODE), Some(&Value::I32(5)));
        assert_eq!(reply.find(keys::DAY), Some(&Value::I16(1)));
        assert_eq!(reply.find(keys::RESULT_LAT), Some(&Value::I32(4_576_400)));
        assert!(!reply.contains(keys::FORECAST_CONDITION_CODE));
    }

    #[tokio::test]
    async fn feels_like_and_forecast_are_honoured() {
        let companion = SimulatedCompanion::new(Simulation::Ok);
        let req = request()
            .with(keys::FEELS_LIKE, Value::I8(1))
            .with(keys::FORECAST, Value::I8(1));
        let reply = companion.handle(&req).await.expect("reply");

        assert_eq!(reply.find(keys::TEMP_K), Some(&Value::I32(283)));
        for slot in 0..FORECAST_SIZE as u32 {
            assert!(reply.contains(keys::FORECAST_CONDITION_CODE + slot));
            assert!(reply.contains(keys::FORECAST_TIME + slot));
            assert!(reply.contains(keys::FORECAST_TEMP_K + slot));
        }
        assert!(reply.size() <= weather_core::message::INBOX_SIZE);
    }

    #[tokio::test]
    async fn no_location_only_fails_without_coordinates() {
        let companion = SimulatedCompanion::new(Simulation::NoLocation);

        let reply = companion.handle(&request()).await.expect("reply");
        assert!(reply.contains(keys::LOCATION_UNAVAILABLE));

        let fixed = request()
            .with(keys::LATITUDE, Value::I32(100))
            .with(keys::LONGITUDE, Value::I32(200));
        let reply = companion.handle(&fixed).await.expect("reply");
        assert_eq!(reply.find(keys::RESULT_LONG), Some(&Value::I32(200)));

        let sentinel = request()
            .with(keys::LATITUDE, Value::I32(-1))
            .with(keys::LONGITUDE, Value::I32(-1));
        let reply = companion.handle(&sentinel).await.expect("reply");
        assert!(reply.contains(keys::LOCATION_UNAVAILABLE));
    }

    #[tokio::test]
    async fn bad_key_and_silent_modes() {
        let bad = SimulatedCompanion::new(Simulation::BadKey);
        let reply = bad.handle(&request()).await.expect("reply");
        assert!(reply.contains(keys::BAD_KEY));

        let silent = SimulatedCompanion::new(Simulation::Silent);
        assert!(silent.handle(&request()).await.is_none());
    }

    #[tokio::test]
    async fn non_requests_are_ignored() {
        let companion = SimulatedCompanion::new(Simulation::Ok);
        assert!(companion.handle(&Message::new()).await.is_none());
    }

    #[test]
    fn icon_mapping() {
        assert_eq!(condition_from_icon(1), ConditionCode::ClearSky);
        assert_eq!(condition_from_icon(50), ConditionCode::Mist);
        assert_eq!(condition_from_icon(7), ConditionCode::Unknown);
    }
}
