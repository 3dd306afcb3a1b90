//! Key/value messages exchanged with the companion.
//!
//! A message is a small ordered dictionary of numbered tuples. Sizes follow the
//! companion channel's accounting: one header byte per message plus seven bytes
//! per tuple on top of the value itself.

use thiserror::Error;

/// Inbox size requested from the transport; large enough for a full forecast reply.
pub const INBOX_SIZE: usize = 1024;
/// Outbox size requested from the transport; a full request is under 100 bytes.
pub const OUTBOX_SIZE: usize = 128;

const DICT_HEADER_SIZE: usize = 1;
const TUPLE_HEADER_SIZE: usize = 7;

/// Message keys shared with the companion.
pub mod keys {
    use crate::model::FORECAST_SIZE;

    // Replies
    pub const REPLY: u32 = 0;
    pub const TEMP_K: u32 = 1;
    pub const NAME: u32 = 2;
    pub const DESCRIPTION: u32 = 3;
    pub const DAY: u32 = 4;
    pub const CONDITION_CODE: u32 = 5;
    pub const SUNRISE: u32 = 6;
    pub const SUNSET: u32 = 7;
    pub const RESULT_LAT: u32 = 8;
    pub const RESULT_LONG: u32 = 9;
    pub const BAD_KEY: u32 = 10;
    pub const LOCATION_UNAVAILABLE: u32 = 11;

    // Requests
    pub const REQUEST: u32 = 12;
    pub const API_KEY: u32 = 13;
    pub const PROVIDER: u32 = 14;
    pub const LATITUDE: u32 = 15;
    pub const LONGITUDE: u32 = 16;
    pub const FEELS_LIKE: u32 = 17;
    pub const FORECAST: u32 = 18;

    // Forecast slot i lives at base + i
    pub const FORECAST_CONDITION_CODE: u32 = 19;
    pub const FORECAST_TIME: u32 = FORECAST_CONDITION_CODE + FORECAST_SIZE as u32;
    pub const FORECAST_TEMP_K: u32 = FORECAST_TIME + FORECAST_SIZE as u32;
}

/// A tuple value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    I8(i8),
    I16(i16),
    I32(i32),
    CString(String),
}

impl Value {
    /// Payload size in bytes; strings count their terminator.
    pub fn payload_size(&self) -> usize {
        match self {
            Value::U8(_) | Value::I8(_) => 1,
            Value::I16(_) => 2,
            Value::I32(_) => 4,
            Value::CString(s) => s.len() + 1,
        }
    }

    /// Integer view of the value, widening as the companion channel does.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::U8(v) => Some(i32::from(*v)),
            Value::I8(v) => Some(i32::from(*v)),
            Value::I16(v) => Some(i32::from(*v)),
            Value::I32(v) => Some(*v),
            Value::CString(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::CString(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("tuple {key} needs {needed} bytes but only {available} remain in the outbox")]
    Overflow {
        key: u32,
        needed: usize,
        available: usize,
    },
}

/// An ordered dictionary of tuples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    tuples: Vec<(u32, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, replacing any earlier tuple with the same key.
    pub fn with(mut self, key: u32, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: u32, value: Value) {
        match self.tuples.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.tuples.push((key, value)),
        }
    }

    pub fn find(&self, key: u32) -> Option<&Value> {
        self.tuples.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.find(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.tuples.iter().map(|(k, _)| *k)
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Serialized size on the companion channel.
    pub fn size(&self) -> usize {
        DICT_HEADER_SIZE
            + self
                .tuples
                .iter()
                .map(|(_, v)| TUPLE_HEADER_SIZE + v.payload_size())
                .sum::<usize>()
    }
}

/// A message under construction in a bounded transmit buffer.
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    message: Message,
}

impl Outbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            message: Message::new(),
        }
    }

    pub fn write(&mut self, key: u32, value: Value) -> Result<(), MessageError> {
        let needed = TUPLE_HEADER_SIZE + value.payload_size();
        let available = self.capacity.saturating_sub(self.message.size());
        if needed > available {
            return Err(MessageError::Overflow {
                key,
                needed,
                available,
            });
        }
        self.message.insert(key, value);
        Ok(())
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_headers_and_terminators() {
        let msg = Message::new()
            .with(keys::REQUEST, Value::U8(1))
            .with(keys::API_KEY, Value::CString("abc".into()));
        assert_eq!(msg.size(), 1 + (7 + 1) + (7 + 4));
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut msg = Message::new().with(keys::TEMP_K, Value::I32(280));
        msg.insert(keys::TEMP_K, Value::I32(290));
        assert_eq!(msg.len(), 1);
        assert_eq!(msg.find(keys::TEMP_K).and_then(Value::as_i32), Some(290));
    }

    #[test]
    fn outbox_rejects_writes_past_capacity() {
        let mut outbox = Outbox::with_capacity(20);
        outbox.write(keys::REQUEST, Value::U8(1)).expect("fits");

        let err = outbox
            .write(keys::API_KEY, Value::CString("0123456789".into()))
            .unwrap_err();
        assert_eq!(
            err,
            MessageError::Overflow {
                key: keys::API_KEY,
                needed: 18,
                available: 11
            }
        );
        assert_eq!(outbox.message().len(), 1);
    }

    #[test]
    fn forecast_key_ranges_do_not_overlap() {
        assert_eq!(keys::FORECAST_TIME, keys::FORECAST_CONDITION_CODE + 24);
        assert_eq!(keys::FORECAST_TEMP_K, keys::FORECAST_TIME + 24);
    }

    #[test]
    fn integer_values_widen() {
        assert_eq!(Value::I8(-3).as_i32(), Some(-3));
        assert_eq!(Value::I16(1).as_i32(), Some(1));
        assert_eq!(Value::CString("x".into()).as_i32(), None);
    }
}
