use log::{info, LevelFilter};
use log4rs::{
  append::console::ConsoleAppender,
  config::{Appender, Root},
  encode::pattern::PatternEncoder,
  Config,
};
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "INFO";

#[derive(Debug, Error)]
pub enum LoggingError {
  #[error("Invalid log level: {0}")]
  InvalidLevel(String),
  #[error("invalid logging configuration: {0}")]
  Config(String),
  #[error("logging is already initialized: {0}")]
  Init(#[from] log::SetLoggerError),
}

/// Logs to stdout at the level named by the `LOG_LEVEL` environment variable.
pub fn initialize() -> Result<log4rs::Handle, LoggingError> {
  let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.into());
  let level_filter = parse_level_filter(&log_level).ok_or(LoggingError::InvalidLevel(log_level))?;

  let stdout = ConsoleAppender::builder()
    .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {h({l:5})} {t} - {m}{n}")))
    .build();
  let config = Config::builder()
    .appender(Appender::builder().build("stdout", Box::new(stdout)))
    .build(Root::builder().appender("stdout").build(level_filter))
    .map_err(|e| LoggingError::Config(e.to_string()))?;

  let handle = log4rs::init_config(config)?;
  info!("Logging Level: {}", &level_filter);
  Ok(handle)
}

fn parse_level_filter(str: &str) -> Option<LevelFilter> {
  match str.to_lowercase().as_str() {
    "off" => Some(LevelFilter::Off),
    "error" => Some(LevelFilter::Error),
    "warn" => Some(LevelFilter::Warn),
    "info" => Some(LevelFilter::Info),
    "debug" => Some(LevelFilter::Debug),
    "trace" => Some(LevelFilter::Trace),
    _ => None,
  }
}
