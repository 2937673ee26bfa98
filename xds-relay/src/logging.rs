//! Log output with a severity that can change while the relay runs.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::Level;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{Layer as _, fmt};

use crate::error::{Error, Result};

/// Current maximum severity of emitted events.
///
/// Cloning this handle creates a new reference to the same level, so an admin
/// surface can hold one clone and change the level for every reader.
#[derive(Clone, Debug)]
pub struct LogLevel {
    level: Arc<AtomicU8>,
}

impl LogLevel {
    /// Create a handle starting at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level: Arc::new(AtomicU8::new(encode(level))),
        }
    }

    /// The current level.
    pub fn get(&self) -> Level {
        decode(self.level.load(Ordering::Relaxed))
    }

    /// Switch to `level`.
    pub fn set(&self, level: Level) {
        self.level.store(encode(level), Ordering::Relaxed);
    }

    /// Switch to the level named `name` (`trace`, `debug`, `info`, `warn` or `error`).
    pub fn set_from_str(&self, name: &str) -> Result<()> {
        self.set(parse_level(name)?);
        Ok(())
    }

    /// Returns true if events at `level` are emitted.
    pub fn enabled(&self, level: &Level) -> bool {
        *level <= self.get()
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

/// Parse a level name.
pub fn parse_level(name: &str) -> Result<Level> {
    Level::from_str(name.trim())
        .map_err(|_| Error::Validation(format!("unknown log level `{name}`")))
}

/// Install the global subscriber, writing events allowed by `level`.
pub fn init(level: &LogLevel) -> Result<()> {
    let level = level.clone();
    let layer = fmt::layer()
        .with_target(true)
        .with_filter(filter_fn(move |metadata| level.enabled(metadata.level())));
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Levels by increasing severity; the index is the stored value.
const LEVELS: [Level; 5] = [
    Level::TRACE,
    Level::DEBUG,
    Level::INFO,
    Level::WARN,
    Level::ERROR,
];

fn encode(level: Level) -> u8 {
    LEVELS
        .iter()
        .position(|l| *l == level)
        .and_then(|i| u8::try_from(i).ok())
        .unwrap_or(2)
}

fn decode(value: u8) -> Level {
    LEVELS
        .get(usize::from(value))
        .copied()
        .unwrap_or(Level::ERROR)
}
