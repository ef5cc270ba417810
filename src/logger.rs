use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE: &str = "turnrelay.log";
pub const REQUEST_FILE: &str = "turnrelay-requests.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `turnrelay=debug`.
    pub log_level: String,
    /// When set, a daily text log and a daily JSON request log go here.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
        }
    }

    fn filter(&self) -> Result<EnvFilter> {
        let filter = EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
        Ok(filter
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?))
    }
}

/// Install the global subscriber.
///
/// - stdout always gets human-readable output at `log_level`.
/// - with a `log_dir`, a plain-text rolling file mirrors stdout.
/// - with a `log_dir`, completed requests (`target = "request"`) also land in a
///   newline-delimited JSON rolling file.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let stdout_layer = fmt::layer().with_target(false).with_filter(config.filter()?);

    let (txt_layer, json_layer) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            let txt_layer = fmt::layer()
                .with_writer(txt_appender)
                .with_ansi(false)
                .with_filter(config.filter()?);

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, REQUEST_FILE);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));
            (Some(txt_layer), Some(json_layer))
        }
        None => (None, None),
    };

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()?;
    Ok(())
}
