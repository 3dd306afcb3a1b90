//! Weather acquisition for devices without their own network access.
//!
//! The device asks a paired companion to fetch weather on its behalf over a
//! small asynchronous message channel. This crate defines:
//! - The fetch parameters and their on-disk form
//! - The request/reply message codec, including the bounded forecast
//! - A session object that tracks fetch status and notifies one receiver
//! - Persistence of the last result in a key-addressed store
//!
//! The channel and the store are traits; `MemoryTransport` and `MemoryStore`
//! are in-memory implementations for tests and host-side simulations.

pub mod codec;
pub mod config;
pub mod message;
pub mod model;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::{Config, Coordinates, Provider};
pub use message::{Message, Outbox, Value};
pub use model::{
    ConditionCode, FORECAST_SIZE, Forecast, ForecastEntry, PeekData, Status, Temperature,
    WeatherInfo,
};
pub use session::{Callback, FetchError, SessionOptions, WeatherSession};
pub use storage::{KeyValueStore, MemoryStore, PersistError, StoreError};
pub use transport::{DropReason, Inbound, MemoryTransport, Transport, TransportError};
