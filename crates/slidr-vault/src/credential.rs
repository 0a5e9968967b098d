//! Secure storage for the shared vault password.
//!
//! The vault subsystem keeps exactly one secret: the password shared by
//! every registered container, stored under one logical name. The OS
//! keychain backs it in production; [`MemoryCredentialStore`] stands in
//! for tests.

use std::collections::HashMap;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Errors from a credential store.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// The platform secret store rejected the operation.
    #[error("Keychain error for {name}: {message}")]
    Backend {
        /// Logical credential name
        name: String,
        /// Platform message
        message: String,
    },
}

/// A secure, OS-provided secret store.
pub trait CredentialStore: Send + Sync {
    /// Save (or replace) the secret stored under `name`.
    fn save(&self, name: &str, value: &SecretString) -> Result<(), CredentialError>;

    /// Load the secret stored under `name`, if any.
    fn load(&self, name: &str) -> Result<Option<SecretString>, CredentialError>;

    /// Delete the secret stored under `name`. Deleting a missing entry is
    /// not an error.
    fn delete(&self, name: &str) -> Result<(), CredentialError>;
}

/// [`CredentialStore`] backed by the platform keychain.
#[derive(Debug, Clone)]
pub struct KeychainCredentialStore {
    service: String,
}

impl KeychainCredentialStore {
    /// Store credentials under the given keychain service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, name).map_err(|e| backend_error(name, &e))
    }
}

fn backend_error(name: &str, error: &keyring::Error) -> CredentialError {
    CredentialError::Backend {
        name: name.to_owned(),
        message: error.to_string(),
    }
}

impl CredentialStore for KeychainCredentialStore {
    fn save(&self, name: &str, value: &SecretString) -> Result<(), CredentialError> {
        self.entry(name)?
            .set_password(value.expose_secret())
            .map_err(|e| backend_error(name, &e))?;
        tracing::debug!("Saved credential {} to keychain", name);
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<SecretString>, CredentialError> {
        match self.entry(name)?.get_password() {
            Ok(password) => Ok(Some(SecretString::from(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(backend_error(name, &e)),
        }
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                tracing::debug!("Removed credential {} from keychain", name);
                Ok(())
            }
            Err(e) => Err(backend_error(name, &e)),
        }
    }
}

fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

/// In-memory [`CredentialStore`] for tests and headless use.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, SecretString>>,
}

impl MemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is stored under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, name: &str, value: &SecretString) -> Result<(), CredentialError> {
        self.entries
            .lock()
            .insert(name.to_owned(), duplicate(value));
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<SecretString>, CredentialError> {
        Ok(self.entries.lock().get(name).map(duplicate))
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        self.entries.lock().remove(name);
        Ok(())
    }
}
