use std::env::VarError;

#[derive(Debug, thiserror::Error)]
pub enum FromEnvError {
  #[error("Invalid value for environment variable {0}: {1}")]
  InvalidKey(String, #[source] anyhow::Error),
  #[error("Environment variable {0} is not valid unicode")]
  NotUnicode(String),
}

/// Read an environment variable, treating unset and empty values as absent
pub fn optional_var(name: &str) -> Result<Option<String>, FromEnvError> {
  match std::env::var(name) {
    Ok(value) if value.trim().is_empty() => Ok(None),
    Ok(value) => Ok(Some(value)),
    Err(VarError::NotPresent) => Ok(None),
    Err(VarError::NotUnicode(_)) => Err(FromEnvError::NotUnicode(name.to_string())),
  }
}
