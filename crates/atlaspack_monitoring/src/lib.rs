//! This module configures tracing for processes that embed the request tracker.
//!
//! The library crates only emit `tracing` events; installing a subscriber is left to the host.
//! Reporting should only be initialized once.
use std::sync::Mutex;

pub use from_env::FromEnvError;
pub use tracer::TracerMode;
pub use tracer::TRACING_MODE_VAR;

mod from_env;
mod tracer;

pub static MONITORING_GUARD: Mutex<Option<MonitoringGuard>> = Mutex::new(None);

pub struct MonitoringGuard {
  #[allow(unused)]
  tracer: tracer::Tracer,
}

#[derive(Debug, Default)]
pub struct MonitoringOptions {
  pub tracing_options: Vec<TracerMode>,
}

impl MonitoringOptions {
  pub fn from_env() -> Result<Self, FromEnvError> {
    Ok(Self {
      tracing_options: TracerMode::from_env()?,
    })
  }
}

pub fn initialize_monitoring(options: MonitoringOptions) -> anyhow::Result<()> {
  let mut global = MONITORING_GUARD
    .lock()
    .map_err(|_| anyhow::anyhow!("Monitoring guard lock is poisoned"))?;

  if global.is_some() {
    tracing::warn!("Monitoring is getting set-up twice, this will no-op");
    return Ok(());
  }

  let tracer = tracer::Tracer::new(&options.tracing_options)?;
  tracing::debug!(log_directory = ?tracer.log_directory(), "Tracing initialized");

  *global = Some(MonitoringGuard { tracer });

  Ok(())
}

pub fn initialize_from_env() -> anyhow::Result<()> {
  initialize_monitoring(MonitoringOptions::from_env()?)
}

/// Drop the tracer guards, flushing buffered log lines
pub fn close_monitoring() {
  if let Ok(mut global) = MONITORING_GUARD.lock() {
    global.take();
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_initialize_monitoring_multiple_times() {
    initialize_monitoring(MonitoringOptions::default()).unwrap();
    initialize_monitoring(MonitoringOptions::default()).unwrap();

    close_monitoring();
  }
}
