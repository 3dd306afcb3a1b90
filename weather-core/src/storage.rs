//! Persistent storage of weather data in a key-addressed store.
//!
//! `WeatherInfo` is written as one fixed-size record. The forecast takes
//! `FORECAST_SIZE + 1` consecutive keys: one record per slot, then the count.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{
    ConditionCode, FORECAST_SIZE, Forecast, ForecastEntry, TEXT_BUFFER_SIZE, Temperature,
    WeatherInfo,
};

/// Largest value a single key may hold.
pub const MAX_DATA_SIZE: usize = 256;

/// Encoded size of a [`WeatherInfo`] record.
pub const WEATHER_RECORD_SIZE: usize = 2 * TEXT_BUFFER_SIZE + 3 * 2 + 1 + 4 + 3 * 8 + 2 * 4;

/// Encoded size of a [`ForecastEntry`] record.
pub const FORECAST_RECORD_SIZE: usize = 8 + 3 * 2 + 4;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value for key {key} is {size} bytes, limit is {MAX_DATA_SIZE}")]
    TooLarge { key: u32, size: usize },
    #[error("key {0} holds a value of a different kind")]
    WrongKind(u32),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record at key {key} is {actual} bytes, expected {expected}")]
    Length {
        key: u32,
        expected: usize,
        actual: usize,
    },
    #[error("forecast starting at key {0} runs past the last key")]
    KeyRange(u32),
}

/// Key-addressed non-volatile storage.
///
/// Keys hold either a byte blob or an integer.
pub trait KeyValueStore {
    fn exists(&self, key: u32) -> bool;

    fn read_data(&self, key: u32) -> Result<Option<Vec<u8>>, StoreError>;

    fn write_data(&mut self, key: u32, data: &[u8]) -> Result<(), StoreError>;

    fn read_int(&self, key: u32) -> Result<Option<i32>, StoreError>;

    fn write_int(&mut self, key: u32, value: i32) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stored {
    Data(Vec<u8>),
    Int(i32),
}

/// In-memory store, e.g. for tests or as a write-back cache.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<u32, Stored>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn exists(&self, key: u32) -> bool {
        self.values.contains_key(&key)
    }

    fn read_data(&self, key: u32) -> Result<Option<Vec<u8>>, StoreError> {
        match self.values.get(&key) {
            None => Ok(None),
            Some(Stored::Data(data)) => Ok(Some(data.clone())),
            Some(Stored::Int(_)) => Err(StoreError::WrongKind(key)),
        }
    }

    fn write_data(&mut self, key: u32, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > MAX_DATA_SIZE {
            return Err(StoreError::TooLarge {
                key,
                size: data.len(),
            });
        }
        self.values.insert(key, Stored::Data(data.to_vec()));
        Ok(())
    }

    fn read_int(&self, key: u32) -> Result<Option<i32>, StoreError> {
        match self.values.get(&key) {
            None => Ok(None),
            Some(Stored::Int(value)) => Ok(Some(*value)),
            Some(Stored::Data(_)) => Err(StoreError::WrongKind(key)),
        }
    }

    fn write_int(&mut self, key: u32, value: i32) -> Result<(), StoreError> {
        self.values.insert(key, Stored::Int(value));
        Ok(())
    }
}

pub fn write_weather<S: KeyValueStore + ?Sized>(
    store: &mut S,
    key: u32,
    info: &WeatherInfo,
) -> Result<(), PersistError> {
    store.write_data(key, &encode_weather(info))?;
    Ok(())
}

/// `Ok(None)` when nothing is stored at `key`.
pub fn read_weather<S: KeyValueStore + ?Sized>(
    store: &S,
    key: u32,
) -> Result<Option<WeatherInfo>, PersistError> {
    let Some(data) = store.read_data(key)? else {
        return Ok(None);
    };
    check_len(key, &data, WEATHER_RECORD_SIZE)?;
    Ok(Some(decode_weather(&data)))
}

pub fn write_forecast<S: KeyValueStore + ?Sized>(
    store: &mut S,
    key: u32,
    forecast: &Forecast,
) -> Result<(), PersistError> {
    let count_key = forecast_count_key(key)?;
    for (slot_key, entry) in (key..count_key).zip(forecast.entries()) {
        store.write_data(slot_key, &encode_forecast_entry(entry))?;
    }
    store.write_int(count_key, forecast.len() as i32)?;
    Ok(())
}

/// `Ok(None)` when no forecast starts at `key`. Missing slots load zeroed
/// and the count is clamped to the buffer.
pub fn read_forecast<S: KeyValueStore + ?Sized>(
    store: &S,
    key: u32,
) -> Result<Option<Forecast>, PersistError> {
    let count_key = forecast_count_key(key)?;
    if !store.exists(key) {
        return Ok(None);
    }

    let mut forecast = Forecast::default();
    for (i, slot_key) in (key..count_key).enumerate() {
        if let Some(data) = store.read_data(slot_key)? {
            check_len(slot_key, &data, FORECAST_RECORD_SIZE)?;
            if let Some(slot) = forecast.slot_mut(i) {
                *slot = decode_forecast_entry(&data);
            }
        }
    }

    let count = store.read_int(count_key)?.unwrap_or(0);
    forecast.set_len(count.max(0) as usize);
    Ok(Some(forecast))
}

/// Key of the count that follows the slots starting at `key`.
fn forecast_count_key(key: u32) -> Result<u32, PersistError> {
    key.checked_add(FORECAST_SIZE as u32)
        .ok_or(PersistError::KeyRange(key))
}

fn check_len(key: u32, data: &[u8], expected: usize) -> Result<(), PersistError> {
    if data.len() != expected {
        return Err(PersistError::Length {
            key,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn encode_weather(info: &WeatherInfo) -> Vec<u8> {
    let mut buf = Vec::with_capacity(WEATHER_RECORD_SIZE);
    put_text(&mut buf, &info.description);
    put_text(&mut buf, &info.name);
    put_temperature(&mut buf, &info.temperature);
    buf.push(u8::from(info.day));
    buf.extend_from_slice(&info.condition.code().to_le_bytes());
    buf.extend_from_slice(&info.timestamp.to_le_bytes());
    buf.extend_from_slice(&info.sunrise.to_le_bytes());
    buf.extend_from_slice(&info.sunset.to_le_bytes());
    buf.extend_from_slice(&info.latitude.to_le_bytes());
    buf.extend_from_slice(&info.longitude.to_le_bytes());
    buf
}

fn decode_weather(data: &[u8]) -> WeatherInfo {
    let mut r = Reader::new(data);
    WeatherInfo {
        description: r.text(),
        name: r.text(),
        temperature: r.temperature(),
        day: r.u8() != 0,
        condition: ConditionCode::from_code(r.i32()),
        timestamp: r.i64(),
        sunrise: r.i64(),
        sunset: r.i64(),
        latitude: r.i32(),
        longitude: r.i32(),
    }
}

fn encode_forecast_entry(entry: &ForecastEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FORECAST_RECORD_SIZE);
    buf.extend_from_slice(&entry.timestamp.to_le_bytes());
    put_temperature(&mut buf, &entry.temperature);
    buf.extend_from_slice(&entry.condition.code().to_le_bytes());
    buf
}

fn decode_forecast_entry(data: &[u8]) -> ForecastEntry {
    let mut r = Reader::new(data);
    ForecastEntry {
        timestamp: r.i64(),
        temperature: r.temperature(),
        condition: ConditionCode::from_code(r.i32()),
    }
}

fn put_text(buf: &mut Vec<u8>, text: &str) {
    let mut field = [0u8; TEXT_BUFFER_SIZE];
    let len = text.len().min(TEXT_BUFFER_SIZE - 1);
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    buf.extend_from_slice(&field);
}

fn put_temperature(buf: &mut Vec<u8>, temperature: &Temperature) {
    buf.extend_from_slice(&temperature.kelvin.to_le_bytes());
    buf.extend_from_slice(&temperature.celsius.to_le_bytes());
    buf.extend_from_slice(&temperature.fahrenheit.to_le_bytes());
}

/// Sequential little-endian reader over a record whose length was checked.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.data.get(self.pos..self.pos + N) {
            out.copy_from_slice(src);
        }
        self.pos += N;
        out
    }

    fn text(&mut self) -> String {
        let field: [u8; TEXT_BUFFER_SIZE] = self.take();
        let end = field.iter().position(|b| *b == 0).unwrap_or(TEXT_BUFFER_SIZE);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }

    fn temperature(&mut self) -> Temperature {
        Temperature {
            kelvin: self.i16(),
            celsius: self.i16(),
            fahrenheit: self.i16(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> WeatherInfo {
        WeatherInfo {
            description: "overcast clouds".into(),
            name: "Reykjavík".into(),
            temperature: Temperature::from_kelvin(276),
            day: true,
            condition: ConditionCode::BrokenClouds,
            timestamp: 1_700_000_123,
            sunrise: 1_699_990_000,
            sunset: 1_700_020_000,
            latitude: 6_414_660,
            longitude: -2_194_260,
        }
    }

    #[test]
    fn record_sizes_fit_the_store_limit() {
        assert_eq!(WEATHER_RECORD_SIZE, 107);
        assert_eq!(FORECAST_RECORD_SIZE, 18);
        assert_eq!(encode_weather(&sample_info()).len(), WEATHER_RECORD_SIZE);
        assert_eq!(
            encode_forecast_entry(&ForecastEntry::default()).len(),
            FORECAST_RECORD_SIZE
        );
    }

    #[test]
    fn weather_roundtrip_is_exact() {
        let mut store = MemoryStore::new();
        let info = sample_info();

        write_weather(&mut store, 7, &info).expect("write succeeds");
        let loaded = read_weather(&store, 7).expect("read succeeds");

        assert_eq!(loaded, Some(info));
    }

    #[test]
    fn read_weather_missing_key_is_none() {
        let store = MemoryStore::new();
        assert_eq!(read_weather(&store, 1).expect("read succeeds"), None);
    }

    #[test]
    fn read_weather_rejects_wrong_length() {
        let mut store = MemoryStore::new();
        store.write_data(3, &[1, 2, 3]).expect("write succeeds");
        let err = read_weather(&store, 3).unwrap_err();
        assert!(matches!(
            err,
            PersistError::Length { key: 3, expected: WEATHER_RECORD_SIZE, actual: 3 }
        ));
    }

    #[test]
    fn forecast_uses_consecutive_keys() {
        let mut store = MemoryStore::new();
        let entry = ForecastEntry::new(1_700_003_600, 281, ConditionCode::Mist);
        let forecast = Forecast::from_entries(&[entry; 3]);

        write_forecast(&mut store, 100, &forecast).expect("write succeeds");

        assert_eq!(store.len(), FORECAST_SIZE + 1);
        assert_eq!(store.read_int(124).expect("int stored"), Some(3));
        assert_eq!(read_forecast(&store, 100).expect("read succeeds"), Some(forecast));
    }

    #[test]
    fn forecast_count_is_clamped() {
        let mut store = MemoryStore::new();
        write_forecast(&mut store, 0, &Forecast::default()).expect("write succeeds");
        store.write_int(FORECAST_SIZE as u32, 99).expect("write succeeds");

        let loaded = read_forecast(&store, 0).expect("read succeeds").expect("present");
        assert_eq!(loaded.len(), FORECAST_SIZE);

        store.write_int(FORECAST_SIZE as u32, -4).expect("write succeeds");
        let loaded = read_forecast(&store, 0).expect("read succeeds").expect("present");
        assert_eq!(loaded.len(), 0);
    }

    #[test]
    fn forecast_past_the_last_key_is_rejected() {
        let mut store = MemoryStore::new();
        let key = u32::MAX - 3;

        let err = write_forecast(&mut store, key, &Forecast::default()).unwrap_err();
        assert!(matches!(err, PersistError::KeyRange(k) if k == key));
        assert!(store.is_empty());

        let err = read_forecast(&store, key).unwrap_err();
        assert!(matches!(err, PersistError::KeyRange(k) if k == key));
    }

    #[test]
    fn forecast_may_end_on_the_last_key() {
        let mut store = MemoryStore::new();
        let key = u32::MAX - FORECAST_SIZE as u32;

        write_forecast(&mut store, key, &Forecast::default()).expect("write succeeds");

        assert_eq!(store.read_int(u32::MAX).expect("int stored"), Some(0));
        assert!(read_forecast(&store, key).expect("read succeeds").is_some());
    }

    #[test]
    fn memory_store_enforces_limits_and_kinds() {
        let mut store = MemoryStore::new();
        let err = store.write_data(1, &[0u8; MAX_DATA_SIZE + 1]).unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { key: 1, .. }));

        store.write_int(2, 5).expect("write succeeds");
        assert!(matches!(store.read_data(2), Err(StoreError::WrongKind(2))));
    }
}
