//! Tracing subscriber setup for the `relais` binary.

use std::error::Error;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "RELAIS_LOG";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Used when neither `RELAIS_LOG` nor `RUST_LOG` is set.
    pub level: String,
    /// Appends plain-text records to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

impl LogOptions {
    pub fn new(level: impl Into<String>, file: Option<PathBuf>) -> Self {
        Self {
            level: level.into(),
            file,
        }
    }
}

fn env_filter(fallback: &str) -> EnvFilter {
    let from_env = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .filter(|directives| !directives.trim().is_empty());
    let directives = from_env.unwrap_or_else(|| {
        if fallback.trim().is_empty() {
            "info".to_string()
        } else {
            fallback.to_string()
        }
    });
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. A second call leaves the first subscriber
/// in place and returns `Ok`.
pub fn init(options: &LogOptions) -> Result<(), Box<dyn Error>> {
    let filter = env_filter(&options.level);

    let layer = match &options.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file))
                .boxed()
        }
        None => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
