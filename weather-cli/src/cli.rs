use std::{cell::RefCell, path::PathBuf, rc::Rc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use inquire::{Confirm, CustomType, Select, Text};
use serde::Serialize;
use tracing::debug;

use weather_core::{
    Callback, Config, Coordinates, FORECAST_SIZE, FetchError, ForecastEntry, MemoryTransport,
    Provider, SessionOptions, Status, WeatherInfo, WeatherSession,
};

use crate::{
    channel::ChannelTransport,
    companion::{self, SimulatedCompanion, Simulation},
    file_store::FileStore,
};

/// How often the fetch loop wakes up to check for a timeout.
const TICK: Duration = Duration::from_millis(100);

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "Companion weather fetch driver")]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store file to use instead of the platform default.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactively set the fetch parameters.
    Configure,

    /// Fetch weather once through a simulated companion and persist it.
    Fetch {
        /// Companion behaviour to simulate.
        #[arg(long, value_enum, default_value_t = Simulation::Ok)]
        simulate: Simulation,

        /// Seconds to wait for the companion before giving up.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u32,

        /// Persistent storage key; the forecast uses the following 25 keys.
        #[arg(long, default_value_t = 1)]
        key: u32,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show weather persisted by an earlier fetch.
    Show {
        #[arg(long, default_value_t = 1)]
        key: u32,

        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => Config::config_file_path()?,
        };
        let store_path = match &self.store {
            Some(path) => path.clone(),
            None => FileStore::default_path()?,
        };

        match self.command {
            Command::Configure => {
                let cfg = Config::load_from(&config_path)?;
                let cfg = prompt_config(cfg)?;
                cfg.save_to(&config_path)?;
                println!("Saved configuration to {}", config_path.display());
            }
            Command::Fetch {
                simulate,
                timeout_secs,
                key,
                json,
            } => {
                let forecast_key = forecast_key(key)?;
                let cfg = Config::load_from(&config_path)?;
                let mut store = FileStore::open(&store_path)?;

                let outcome = run_fetch(cfg, simulate, timeout_secs, !json).await?;
                let peek = outcome
                    .session
                    .peek()
                    .context("weather session was not initialized")?;

                if peek.status == Status::Available {
                    outcome.session.save(&mut store, key)?;
                    outcome.session.save_forecast(&mut store, forecast_key)?;
                    store.flush()?;
                    debug!(path = %store.path().display(), key, "persisted weather");
                }

                let report = Report {
                    status: Some(peek.status),
                    transitions: &outcome.statuses,
                    info: peek.info,
                    forecast: &peek.forecast[..peek.forecast_len],
                };
                report.print(json)?;
            }
            Command::Show { key, json } => {
                let forecast_key = forecast_key(key)?;
                let cfg = Config::load_from(&config_path)?;
                let store = FileStore::open(&store_path)?;

                let mut session = WeatherSession::new(MemoryTransport::disconnected());
                session.init();
                session.configure(cfg);

                if !session.load(&store, key)? {
                    println!("No weather stored at key {key}. Run `weather fetch` first.");
                    return Ok(());
                }
                session.load_forecast(&store, forecast_key)?;

                let peek = session
                    .peek()
                    .context("weather session was not initialized")?;
                let report = Report {
                    status: None,
                    transitions: &[],
                    info: peek.info,
                    forecast: &peek.forecast[..peek.forecast_len],
                };
                report.print(json)?;
            }
        }

        Ok(())
    }
}

/// First key of the forecast stored after the weather record at `key`.
///
/// The forecast takes `FORECAST_SIZE + 1` keys, all of which must exist.
fn forecast_key(key: u32) -> Result<u32> {
    key.checked_add(1)
        .filter(|first| first.checked_add(FORECAST_SIZE as u32).is_some())
        .with_context(|| format!("key {key} leaves no room for the forecast that follows it"))
}

/// A finished fetch: the settled session and every status it went through.
pub struct FetchOutcome {
    pub session: WeatherSession<ChannelTransport>,
    pub statuses: Vec<Status>,
}

/// Runs one fetch against a simulated companion until it leaves `Pending`.
pub async fn run_fetch(
    cfg: Config,
    simulate: Simulation,
    timeout_secs: u32,
    verbose: bool,
) -> Result<FetchOutcome> {
    let (transport, link) = ChannelTransport::pair(simulate != Simulation::Disconnected);
    let server = tokio::spawn(companion::serve(
        SimulatedCompanion::new(simulate),
        link.requests,
        link.replies,
    ));

    let options = SessionOptions {
        pending_timeout: Some(chrono::Duration::seconds(i64::from(timeout_secs))),
        ..SessionOptions::default()
    };
    let mut session = WeatherSession::with_options(transport, options);
    session.init();
    session.configure(cfg);

    let seen: Rc<RefCell<Vec<Status>>> = Rc::default();
    let sink = Rc::clone(&seen);
    let callback: Callback = Box::new(move |_info, _forecast, forecast_len, status| {
        if verbose {
            match status {
                Status::Available => println!("status: {status} ({forecast_len} forecast entries)"),
                _ => println!("status: {status}"),
            }
        }
        sink.borrow_mut().push(status);
    });

    match session.fetch(Some(callback)) {
        Ok(()) => {}
        Err(e @ (FetchError::NotInitialized | FetchError::MissingCallback)) => return Err(e.into()),
        // already reported through the callback
        Err(e) => debug!(error = %e, "fetch request was not sent"),
    }

    while session.status().is_some_and(|s| !s.is_terminal()) {
        match tokio::time::timeout(TICK, session.transport_mut().recv()).await {
            Ok(Some(inbound)) => session.handle_inbound(inbound),
            // companion went away; only the timeout can end this fetch now
            Ok(None) => tokio::time::sleep(TICK).await,
            Err(_elapsed) => {}
        }
        session.check_timeout(Utc::now());
    }

    // A silent companion would otherwise outlive the fetch.
    server.abort();

    let statuses = seen.borrow().clone();
    Ok(FetchOutcome { session, statuses })
}

/// Printable summary of a session's data.
#[derive(Debug, Serialize)]
struct Report<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
    /// Every status the fetch went through, oldest first.
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    transitions: &'a [Status],
    info: &'a WeatherInfo,
    forecast: &'a [ForecastEntry],
}

impl Report<'_> {
    fn print(&self, json: bool) -> Result<()> {
        if json {
            let out = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
            println!("{out}");
            return Ok(());
        }

        if let Some(status) = self.status.filter(|s| *s != Status::Available) {
            println!("No weather available: {status}");
            return Ok(());
        }

        let info = self.info;
        let t = info.temperature;
        println!(
            "{}: {}, {}°C ({}°F), {}",
            display_or(&info.name, "unknown location"),
            display_or(&info.description, info.condition.description()),
            t.celsius,
            t.fahrenheit,
            if info.day { "day" } else { "night" },
        );
        println!(
            "  sunrise {}  sunset {}  fetched {}",
            format_time(info.sunrise),
            format_time(info.sunset),
            format_time(info.timestamp),
        );
        println!(
            "  location {:.5}, {:.5}",
            f64::from(info.latitude) / 100_000.0,
            f64::from(info.longitude) / 100_000.0,
        );

        if !self.forecast.is_empty() {
            println!("  forecast:");
            for entry in self.forecast {
                println!(
                    "    {}  {:>4}°C  {}",
                    format_time(entry.timestamp),
                    entry.temperature.celsius,
                    entry.condition.description(),
                );
            }
        }

        Ok(())
    }
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

fn format_time(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn prompt_config(mut cfg: Config) -> Result<Config> {
    let api_key = Text::new("API key (empty lets the companion use its own):")
        .with_default(&cfg.api_key)
        .prompt()?;
    cfg.set_api_key(Some(api_key.trim()));

    const DEFAULT_PROVIDER: &str = "companion default";
    let mut options = vec![DEFAULT_PROVIDER.to_string()];
    options.extend(Provider::all().iter().map(Provider::to_string));
    let cursor = cfg
        .provider
        .and_then(|p| Provider::all().iter().position(|q| *q == p))
        .map_or(0, |i| i + 1);
    let choice = Select::new("Provider:", options)
        .with_starting_cursor(cursor)
        .prompt()?;
    cfg.set_provider(if choice == DEFAULT_PROVIDER {
        None
    } else {
        Some(Provider::try_from(choice.as_str())?)
    });

    let use_gps = Confirm::new("Use the companion's GPS location?")
        .with_default(cfg.location.is_none())
        .prompt()?;
    cfg.set_location(if use_gps {
        None
    } else {
        let latitude = CustomType::<f64>::new("Latitude (degrees):").prompt()?;
        let longitude = CustomType::<f64>::new("Longitude (degrees):").prompt()?;
        Some(Coordinates::from_degrees(latitude, longitude))
    });

    cfg.set_feels_like(
        Confirm::new("Report the \"feels like\" temperature?")
            .with_default(cfg.feels_like)
            .prompt()?,
    );
    cfg.set_forecast(
        Confirm::new("Fetch the forecast as well?")
            .with_default(cfg.forecast)
            .prompt()?,
    );

    Ok(cfg)
}
