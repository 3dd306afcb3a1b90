//! Fetch coordination and status tracking for one weather session.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    codec::{self, Reply},
    config::{Config, Coordinates, Provider},
    message::{INBOX_SIZE, MessageError, OUTBOX_SIZE},
    model::{FORECAST_SIZE, Forecast, ForecastEntry, PeekData, Status, WeatherInfo},
    storage::{self, KeyValueStore, PersistError},
    transport::{Inbound, Transport, TransportError},
};

/// Receiver of status changes.
///
/// Called with the current info, the forecast buffer, the number of valid
/// forecast slots (zero for any status other than `Available`) and the new
/// status.
pub type Callback = Box<dyn FnMut(&WeatherInfo, &[ForecastEntry; FORECAST_SIZE], usize, Status)>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("weather session is not initialized")]
    NotInitialized,
    #[error("no callback was given")]
    MissingCallback,
    #[error("companion is disconnected")]
    Disconnected,
    #[error("could not open outbox")]
    Outbox(#[source] TransportError),
    #[error("request does not fit in the outbox")]
    Encode(#[from] MessageError),
    #[error("could not send request")]
    Send(#[source] TransportError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub inbox_size: usize,
    pub outbox_size: usize,
    /// How long a request may stay pending before `check_timeout` fails it.
    /// `None` waits forever.
    pub pending_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            inbox_size: INBOX_SIZE,
            outbox_size: OUTBOX_SIZE,
            pending_timeout: Some(Duration::seconds(30)),
        }
    }
}

/// Per-session state, present between `init` and `deinit`.
struct Active {
    info: WeatherInfo,
    forecast: Forecast,
    config: Config,
    status: Status,
    pending_since: Option<DateTime<Utc>>,
    callback: Option<Callback>,
}

impl Active {
    fn new() -> Self {
        Self {
            info: WeatherInfo::default(),
            forecast: Forecast::default(),
            config: Config::default(),
            status: Status::NotYetFetched,
            pending_since: None,
            callback: None,
        }
    }

    /// Records `status` and notifies the receiver, if any.
    fn transition(&mut self, status: Status) {
        info!(from = %self.status, to = %status, "weather status changed");
        self.status = status;
        if status != Status::Pending {
            self.pending_since = None;
        }

        let reported = if status == Status::Available {
            self.forecast.len()
        } else {
            0
        };
        if let Some(callback) = self.callback.as_mut() {
            callback(&self.info, self.forecast.entries(), reported, status);
        }
    }
}

/// One weather session over a companion transport.
///
/// A session starts uninitialized. `init` allocates the data and starts
/// listening on the transport, `deinit` drops everything regardless of
/// a pending fetch. Only one fetch is outstanding at a time: a new `fetch`
/// replaces the receiver of the previous one.
pub struct WeatherSession<T: Transport> {
    transport: T,
    options: SessionOptions,
    active: Option<Active>,
}

impl<T: Transport> WeatherSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, SessionOptions::default())
    }

    pub fn with_options(transport: T, options: SessionOptions) -> Self {
        Self {
            transport,
            options,
            active: None,
        }
    }

    /// (Re)initializes the session with default config and empty data.
    pub fn init(&mut self) {
        self.transport
            .open(self.options.inbox_size, self.options.outbox_size);
        self.active = Some(Active::new());
        debug!("weather session initialized");
    }

    pub fn deinit(&mut self) {
        if self.active.take().is_some() {
            self.transport.close();
            debug!("weather session deinitialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> Option<&Config> {
        self.active.as_ref().map(|a| &a.config)
    }

    /// Replaces the whole config at once.
    pub fn configure(&mut self, config: Config) {
        self.with_config(|c| *c = config);
    }

    pub fn set_api_key(&mut self, api_key: Option<&str>) {
        self.with_config(|c| c.set_api_key(api_key));
    }

    pub fn set_provider(&mut self, provider: Option<Provider>) {
        self.with_config(|c| c.set_provider(provider));
    }

    pub fn set_location(&mut self, location: Option<Coordinates>) {
        self.with_config(|c| c.set_location(location));
    }

    pub fn set_feels_like(&mut self, feels_like: bool) {
        self.with_config(|c| c.set_feels_like(feels_like));
    }

    pub fn set_forecast(&mut self, forecast: bool) {
        self.with_config(|c| c.set_forecast(forecast));
    }

    fn with_config(&mut self, f: impl FnOnce(&mut Config)) {
        match self.active.as_mut() {
            Some(active) => f(&mut active.config),
            None => debug!("config change ignored, session not initialized"),
        }
    }

    /// Current status, `None` when uninitialized.
    pub fn status(&self) -> Option<Status> {
        self.active.as_ref().map(|a| a.status)
    }

    pub fn peek(&self) -> Option<PeekData<'_>> {
        self.active.as_ref().map(|a| PeekData {
            info: &a.info,
            forecast: a.forecast.entries(),
            forecast_len: a.forecast.len(),
            status: a.status,
        })
    }

    /// Sends a fetch request; the outcome arrives through `callback`.
    ///
    /// Fails without touching any state when the session is uninitialized or
    /// `callback` is `None`. Every other failure is also reported to the
    /// callback as a status change.
    pub fn fetch(&mut self, callback: Option<Callback>) -> Result<(), FetchError> {
        self.fetch_at(callback, Utc::now())
    }

    pub fn fetch_at(
        &mut self,
        callback: Option<Callback>,
        now: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let active = self.active.as_mut().ok_or(FetchError::NotInitialized)?;
        let callback = callback.ok_or(FetchError::MissingCallback)?;
        active.callback = Some(callback);

        if !self.transport.is_connected() {
            active.transition(Status::BluetoothDisconnected);
            return Err(FetchError::Disconnected);
        }

        let mut outbox = match self.transport.begin_outbox() {
            Ok(outbox) => outbox,
            Err(e) => {
                warn!(error = %e, "could not open outbox");
                active.transition(Status::Failed);
                return Err(FetchError::Outbox(e));
            }
        };

        if let Err(e) = codec::encode_request(&active.config, &mut outbox) {
            warn!(error = %e, "could not encode weather request");
            active.transition(Status::Failed);
            return Err(e.into());
        }

        if let Err(e) = self.transport.send(outbox) {
            warn!(error = %e, "could not send weather request");
            active.transition(Status::Failed);
            return Err(FetchError::Send(e));
        }

        active.pending_since = Some(now);
        active.transition(Status::Pending);
        Ok(())
    }

    /// Reacts to one event from the transport.
    pub fn handle_inbound(&mut self, inbound: Inbound) {
        self.handle_inbound_at(inbound, Utc::now());
    }

    pub fn handle_inbound_at(&mut self, inbound: Inbound, now: DateTime<Utc>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let message = match inbound {
            Inbound::Received(message) => message,
            Inbound::Dropped(reason) => {
                warn!(?reason, "inbox dropped a message");
                return;
            }
        };

        match codec::decode_reply(&message, active.config.forecast) {
            Ok(Some(Reply::Weather(reply))) => {
                reply.apply_to(&mut active.info, now.timestamp());
                match &reply.forecast {
                    Some(forecast) => active.forecast = forecast.clone(),
                    None => active.forecast.set_len(0),
                }
                active.transition(Status::Available);
            }
            Ok(Some(Reply::BadKey)) => {
                active.forecast.set_len(0);
                active.transition(Status::BadKey);
            }
            Ok(Some(Reply::LocationUnavailable)) => {
                active.forecast.set_len(0);
                active.transition(Status::LocationUnavailable);
            }
            Ok(None) => debug!("ignoring unrelated inbound message"),
            Err(e) => {
                warn!(error = %e, "malformed weather reply");
                active.transition(Status::Failed);
            }
        }
    }

    /// Drains the transport, handling every queued event. Returns how many
    /// events were handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(inbound) = self.transport.poll_inbound() {
            self.handle_inbound(inbound);
            handled += 1;
        }
        handled
    }

    /// Fails a pending fetch that has waited longer than the configured
    /// timeout. Returns true if it did.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.options.pending_timeout else {
            return false;
        };
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        match active.pending_since {
            Some(since) if active.status == Status::Pending && now - since >= timeout => {
                warn!(waited_secs = (now - since).num_seconds(), "weather reply timed out");
                active.transition(Status::Failed);
                true
            }
            _ => false,
        }
    }

    /// Writes the current info at `key`. `Ok(false)` when uninitialized.
    pub fn save<S: KeyValueStore + ?Sized>(&self, store: &mut S, key: u32) -> Result<bool, PersistError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(false);
        };
        storage::write_weather(store, key, &active.info)?;
        Ok(true)
    }

    /// Replaces the current info with the one stored at `key`, if any.
    pub fn load<S: KeyValueStore + ?Sized>(&mut self, store: &S, key: u32) -> Result<bool, PersistError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(false);
        };
        match storage::read_weather(store, key)? {
            Some(info) => {
                active.info = info;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes the forecast at `key..=key + FORECAST_SIZE`. A no-op unless
    /// forecasting is enabled.
    pub fn save_forecast<S: KeyValueStore + ?Sized>(
        &self,
        store: &mut S,
        key: u32,
    ) -> Result<bool, PersistError> {
        let Some(active) = self.active.as_ref().filter(|a| a.config.forecast) else {
            return Ok(false);
        };
        storage::write_forecast(store, key, &active.forecast)?;
        Ok(true)
    }

    /// Inverse of `save_forecast`; also a no-op unless forecasting is enabled.
    pub fn load_forecast<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        key: u32,
    ) -> Result<bool, PersistError> {
        let Some(active) = self.active.as_mut().filter(|a| a.config.forecast) else {
            return Ok(false);
        };
        match storage::read_forecast(store, key)? {
            Some(forecast) => {
                active.forecast = forecast;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        codec::tests::{sample_reply, with_forecast_slots},
        message::{Message, Value, keys},
        storage::MemoryStore,
        transport::{DropReason, MemoryTransport},
    };

    type Log = Rc<RefCell<Vec<(Status, usize)>>>;

    fn recorder() -> (Log, Callback) {
        let log: Log = Rc::default();
        let sink = Rc::clone(&log);
        let callback: Callback = Box::new(move |_info, _forecast, len, status| {
            sink.borrow_mut().push((status, len));
        });
        (log, callback)
    }

    fn session() -> WeatherSession<MemoryTransport> {
        let mut session = WeatherSession::new(MemoryTransport::connected());
        session.init();
        session
    }

    fn reply(session: &mut WeatherSession<MemoryTransport>, message: Message) {
        session.transport_mut().push_inbound(message);
        session.poll();
    }

    #[test]
    fn init_opens_transport_with_buffer_sizes() {
        let session = session();
        assert!(session.transport().is_listening());
        assert_eq!(session.transport().buffer_sizes(), (INBOX_SIZE, OUTBOX_SIZE));
        assert_eq!(session.status(), Some(Status::NotYetFetched));
        assert_eq!(session.config(), Some(&Config::default()));
    }

    #[test]
    fn fetch_uninitialized_fails_without_callback() {
        let mut session = WeatherSession::new(MemoryTransport::connected());
        let (log, callback) = recorder();

        let err = session.fetch(Some(callback)).unwrap_err();

        assert!(matches!(err, FetchError::NotInitialized));
        assert!(log.borrow().is_empty());
        assert!(session.peek().is_none());
    }

    #[test]
    fn fetch_without_callback_changes_nothing() {
        let mut session = session();
        let err = session.fetch(None).unwrap_err();

        assert!(matches!(err, FetchError::MissingCallback));
        assert_eq!(session.status(), Some(Status::NotYetFetched));
        assert!(session.transport().sent().is_empty());
    }

    #[test]
    fn fetch_while_disconnected_reports_once_and_sends_nothing() {
        let mut session = WeatherSession::new(MemoryTransport::disconnected());
        session.init();
        let (log, callback) = recorder();

        let err = session.fetch(Some(callback)).unwrap_err();

        assert!(matches!(err, FetchError::Disconnected));
        assert_eq!(*log.borrow(), vec![(Status::BluetoothDisconnected, 0)]);
        assert!(session.transport().sent().is_empty());
    }

    #[test]
    fn outbox_and_send_failures_report_failed() {
        let mut session = session();
        session.transport_mut().fail_open_outbox = true;
        let (log, callback) = recorder();
        assert!(matches!(session.fetch(Some(callback)), Err(FetchError::Outbox(_))));
        assert_eq!(*log.borrow(), vec![(Status::Failed, 0)]);

        session.transport_mut().fail_open_outbox = false;
        session.transport_mut().fail_send = true;
        let (log, callback) = recorder();
        assert!(matches!(session.fetch(Some(callback)), Err(FetchError::Send(_))));
        assert_eq!(*log.borrow(), vec![(Status::Failed, 0)]);
    }

    #[test]
    fn default_config_sends_only_request_marker() {
        let mut session = session();
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        let sent = session.transport().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].keys().collect::<Vec<_>>(), vec![keys::REQUEST]);
    }

    #[test]
    fn successful_fetch_reports_pending_then_available() {
        let mut session = session();
        session.set_forecast(true);
        let (log, callback) = recorder();

        session.fetch(Some(callback)).expect("fetch succeeds");
        assert_eq!(session.status(), Some(Status::Pending));

        reply(&mut session, with_forecast_slots(sample_reply(), 0..6));

        assert_eq!(
            *log.borrow(),
            vec![(Status::Pending, 0), (Status::Available, 6)]
        );
        let peek = session.peek().expect("initialized");
        assert_eq!(peek.info.name, "Lyon");
        assert_eq!(peek.info.temperature.celsius, 11);
        assert_eq!(peek.forecast_len, 6);
        assert!(peek.forecast[6..].iter().all(ForecastEntry::is_zeroed));
    }

    #[test]
    fn reply_stamps_decode_time() {
        let mut session = session();
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        let now = DateTime::from_timestamp(1_750_000_000, 0).expect("valid timestamp");
        session.handle_inbound_at(Inbound::Received(sample_reply()), now);

        assert_eq!(session.peek().map(|p| p.info.timestamp), Some(1_750_000_000));
    }

    #[test]
    fn forecast_disabled_keeps_count_at_zero() {
        let mut session = session();
        let (log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        reply(&mut session, with_forecast_slots(sample_reply(), 0..24));

        assert_eq!(log.borrow().last(), Some(&(Status::Available, 0)));
        assert_eq!(session.peek().map(|p| p.forecast_len), Some(0));
    }

    #[test]
    fn reply_with_forecast_disabled_resets_the_count() {
        let mut session = session();
        session.set_forecast(true);
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(&mut session, with_forecast_slots(sample_reply(), 0..5));

        session.set_forecast(false);
        let (log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(&mut session, with_forecast_slots(sample_reply(), 0..24));

        // Forecast fields are ignored; old entries stay but are no longer counted.
        assert_eq!(*log.borrow(), vec![(Status::Pending, 0), (Status::Available, 0)]);
        let peek = session.peek().expect("initialized");
        assert_eq!(peek.forecast_len, 0);
        assert!(!peek.forecast[4].is_zeroed());
        assert!(peek.forecast[5..].iter().all(ForecastEntry::is_zeroed));
    }

    #[test]
    fn bad_key_resets_forecast_count_and_keeps_info() {
        let mut session = session();
        session.set_forecast(true);
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(&mut session, with_forecast_slots(sample_reply(), 0..3));
        let before = session.peek().map(|p| p.info.clone());

        let (log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(&mut session, Message::new().with(keys::BAD_KEY, Value::U8(1)));

        assert_eq!(log.borrow().last(), Some(&(Status::BadKey, 0)));
        let peek = session.peek().expect("initialized");
        assert_eq!(peek.forecast_len, 0);
        assert_eq!(Some(peek.info.clone()), before);
    }

    #[test]
    fn location_unavailable_is_reported() {
        let mut session = session();
        let (log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(&mut session, Message::new().with(keys::LOCATION_UNAVAILABLE, Value::U8(1)));

        assert_eq!(log.borrow().last(), Some(&(Status::LocationUnavailable, 0)));
    }

    #[test]
    fn unrelated_and_dropped_messages_leave_session_pending() {
        let mut session = session();
        let (log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        reply(&mut session, Message::new().with(keys::REQUEST, Value::U8(1)));
        session.transport_mut().push_dropped(DropReason::Busy);
        assert_eq!(session.poll(), 1);

        assert_eq!(session.status(), Some(Status::Pending));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn malformed_reply_fails_the_fetch() {
        let mut session = session();
        let (log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        reply(&mut session, Message::new().with(keys::REPLY, Value::U8(1)));

        assert_eq!(log.borrow().last(), Some(&(Status::Failed, 0)));
        assert_eq!(session.peek().map(|p| p.info.clone()), Some(WeatherInfo::default()));
    }

    #[test]
    fn second_fetch_replaces_the_receiver() {
        let mut session = session();
        let (first, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        let (second, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        reply(&mut session, sample_reply());

        assert_eq!(*first.borrow(), vec![(Status::Pending, 0)]);
        assert_eq!(
            *second.borrow(),
            vec![(Status::Pending, 0), (Status::Available, 0)]
        );
    }

    #[test]
    fn pending_times_out_once() {
        let mut session = session();
        let (log, callback) = recorder();
        let start = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        session.fetch_at(Some(callback), start).expect("fetch succeeds");

        assert!(!session.check_timeout(start + Duration::seconds(29)));
        assert!(session.check_timeout(start + Duration::seconds(30)));
        assert!(!session.check_timeout(start + Duration::seconds(60)));

        assert_eq!(*log.borrow(), vec![(Status::Pending, 0), (Status::Failed, 0)]);
    }

    #[test]
    fn timeout_can_be_disabled() {
        let options = SessionOptions {
            pending_timeout: None,
            ..SessionOptions::default()
        };
        let mut session = WeatherSession::with_options(MemoryTransport::connected(), options);
        session.init();
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        assert!(!session.check_timeout(Utc::now() + Duration::days(1)));
        assert_eq!(session.status(), Some(Status::Pending));
    }

    #[test]
    fn deinit_drops_state_and_stops_listening() {
        let mut session = session();
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");

        session.deinit();

        assert!(!session.is_initialized());
        assert!(!session.transport().is_listening());
        assert!(session.peek().is_none());
        assert!(session.config().is_none());
    }

    #[test]
    fn setters_are_ignored_when_uninitialized() {
        let mut session = WeatherSession::new(MemoryTransport::connected());
        session.set_api_key(Some("KEY"));
        session.init();
        assert_eq!(session.config().map(|c| c.api_key.as_str()), Some(""));
    }

    #[test]
    fn save_and_load_into_fresh_session() {
        let mut store = MemoryStore::new();
        let mut session = session();
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(
            &mut session,
            sample_reply()
                .with(keys::RESULT_LAT, Value::I32(4576000))
                .with(keys::RESULT_LONG, Value::I32(483000)),
        );
        assert_eq!(session.save(&mut store, 1).ok(), Some(true));

        let mut fresh = self::session();
        assert_eq!(fresh.load(&store, 1).ok(), Some(true));
        assert_eq!(
            fresh.peek().map(|p| p.info.clone()),
            session.peek().map(|p| p.info.clone())
        );
        assert_eq!(fresh.peek().map(|p| p.info.latitude), Some(4576000));

        assert_eq!(fresh.load(&store, 2).ok(), Some(false));
    }

    #[test]
    fn forecast_persistence_requires_the_forecast_flag() {
        let mut store = MemoryStore::new();
        let mut session = session();
        session.set_forecast(true);
        let (_log, callback) = recorder();
        session.fetch(Some(callback)).expect("fetch succeeds");
        reply(&mut session, with_forecast_slots(sample_reply(), 0..10));

        session.set_forecast(false);
        assert_eq!(session.save_forecast(&mut store, 50).ok(), Some(false));
        assert!(store.is_empty());

        session.set_forecast(true);
        assert_eq!(session.save_forecast(&mut store, 50).ok(), Some(true));
        assert_eq!(store.len(), FORECAST_SIZE + 1);

        let mut fresh = self::session();
        assert_eq!(fresh.load_forecast(&store, 50).ok(), Some(false));
        assert_eq!(fresh.peek().map(|p| p.forecast_len), Some(0));

        fresh.set_forecast(true);
        assert_eq!(fresh.load_forecast(&store, 50).ok(), Some(true));
        let peek = fresh.peek().expect("initialized");
        assert_eq!(peek.forecast_len, 10);
        assert_eq!(
            peek.forecast,
            session.peek().expect("initialized").forecast
        );
    }

    #[test]
    fn persistence_is_a_noop_when_uninitialized() {
        let mut store = MemoryStore::new();
        let mut session = WeatherSession::new(MemoryTransport::connected());
        assert_eq!(session.save(&mut store, 1).ok(), Some(false));
        assert_eq!(session.load(&store, 1).ok(), Some(false));
        assert!(store.is_empty());
    }
}
