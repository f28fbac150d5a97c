//! Credential resolution for backends that require auth

use std::env;

use crate::backend::Backend;
use crate::{Error, Result};

/// Resolves the bearer credential of a backend at call time
pub trait CredentialProvider: Send + Sync {
    /// Credential for `backend`, or `None` when it has none
    fn credential(&self, backend: &Backend) -> Option<String>;
}

/// Resolves `env:VAR` references from the process environment; any other
/// reference is used verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credential(&self, backend: &Backend) -> Option<String> {
        let reference = backend.config.credential.as_deref()?;
        match reference.strip_prefix("env:") {
            Some(var) => env::var(var).ok().filter(|v| !v.is_empty()),
            None => Some(reference.to_string()),
        }
    }
}

/// Bearer token for a call to `backend`.
///
/// # Errors
///
/// Returns [`Error::Config`] when the backend requires auth and the provider
/// yields nothing. That is a configuration problem, not a transient failure.
pub fn bearer_for(provider: &dyn CredentialProvider, backend: &Backend) -> Result<Option<String>> {
    if !backend.config.requires_auth {
        return Ok(None);
    }
    provider.credential(backend).map(Some).ok_or_else(|| {
        Error::Config(format!("backend '{}': credential could not be resolved", backend.id))
    })
}
