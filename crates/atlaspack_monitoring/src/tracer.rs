//! This module configures `tracing_subscriber` to write to a rolling log file and, optionally,
//! standard output and a Chrome trace.
use std::path::PathBuf;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

use crate::from_env::optional_var;
use crate::from_env::FromEnvError;

pub const TRACING_MODE_VAR: &str = "ATLASPACK_TRACING_MODE";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum TracerMode {
  /// Output the Tracer logs to Stdout
  Stdout,
  /// Output a Chrome profile
  Chrome,
}

impl TracerMode {
  /// Parse `ATLASPACK_TRACING_MODE`, a comma separated list of modes. Duplicates are ignored.
  pub fn from_env() -> Result<Vec<Self>, FromEnvError> {
    let Some(mode) = optional_var(TRACING_MODE_VAR)? else {
      return Ok(vec![]);
    };

    Self::parse_list(&mode)
  }

  pub fn parse_list(value: &str) -> Result<Vec<Self>, FromEnvError> {
    let mut tracer_modes = Vec::new();

    for mode in value.split(',').map(str::trim).filter(|m| !m.is_empty()) {
      let tracer_mode = match mode {
        "stdout" => Self::Stdout,
        "chrome" => Self::Chrome,
        // The log file is always written
        "file" => continue,
        value => {
          return Err(FromEnvError::InvalidKey(
            String::from(TRACING_MODE_VAR),
            anyhow!("Invalid value: {}", value),
          ))
        }
      };

      if !tracer_modes.contains(&tracer_mode) {
        tracer_modes.push(tracer_mode);
      }
    }

    Ok(tracer_modes)
  }
}

enum TracerGuard {
  #[allow(unused)]
  WorkerGuard(WorkerGuard),
  #[allow(unused)]
  ChromeGuard(tracing_chrome::FlushGuard),
}

/// Keeps the non-blocking writers alive; dropping it flushes pending log lines
pub struct Tracer {
  #[allow(unused)]
  guards: Vec<TracerGuard>,
  log_directory: PathBuf,
}

impl Tracer {
  pub fn new(options: &[TracerMode]) -> anyhow::Result<Self> {
    let mut guards = vec![];

    let log_directory = std::env::temp_dir().join("atlaspack_trace");
    let file_appender = tracing_appender::rolling::Builder::new()
      .rotation(tracing_appender::rolling::Rotation::HOURLY)
      .max_log_files(4)
      .filename_prefix("atlaspack-request-tracker")
      .build(&log_directory)
      .map_err(|err| anyhow!(err))?;
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    guards.push(TracerGuard::WorkerGuard(worker_guard));

    let file_layer = tracing_subscriber::fmt::layer()
      .with_writer(non_blocking)
      .with_span_events(FmtSpan::CLOSE)
      .with_filter(EnvFilter::from_default_env());

    let stdout_layer = if options.contains(&TracerMode::Stdout) {
      let (non_blocking, worker_guard) = tracing_appender::non_blocking(std::io::stdout());
      guards.push(TracerGuard::WorkerGuard(worker_guard));

      Some(
        tracing_subscriber::fmt::layer()
          .with_writer(non_blocking)
          .with_span_events(FmtSpan::CLOSE)
          .with_filter(EnvFilter::from_default_env()),
      )
    } else {
      None
    };

    let chrome_layer = if options.contains(&TracerMode::Chrome) {
      let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .include_args(true)
        .build();
      guards.push(TracerGuard::ChromeGuard(guard));

      Some(chrome_layer)
    } else {
      None
    };

    let subscriber = Registry::default()
      .with(file_layer)
      .with(stdout_layer)
      .with(chrome_layer);

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(Self {
      guards,
      log_directory,
    })
  }

  pub fn log_directory(&self) -> &PathBuf {
    &self.log_directory
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn parses_an_empty_list() {
    assert_eq!(TracerMode::parse_list("").unwrap(), vec![]);
  }

  #[test]
  fn parses_and_deduplicates_modes() {
    let modes = TracerMode::parse_list("stdout, chrome,stdout,file").unwrap();
    assert_eq!(modes, vec![TracerMode::Stdout, TracerMode::Chrome]);
  }

  #[test]
  fn rejects_unknown_modes() {
    let error = TracerMode::parse_list("stdout,syslog").unwrap_err();
    assert!(matches!(error, FromEnvError::InvalidKey(key, _) if key == TRACING_MODE_VAR));
  }
}
