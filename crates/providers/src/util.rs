//! Shared utility functions for provider adapters.

use cf_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key from the named environment variable.
///
/// An empty variable name means "no key" (local servers such as Ollama).
pub fn resolve_api_key(env_var: &str) -> Result<Option<String>> {
    if env_var.is_empty() {
        return Ok(None);
    }
    match std::env::var(env_var) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
        Ok(_) | Err(std::env::VarError::NotPresent) => {
            tracing::warn!(env_var = %env_var, "API key env var not set, sending unauthenticated requests");
            Ok(None)
        }
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::Config(format!(
            "environment variable '{env_var}' is not valid UTF-8"
        ))),
    }
}
