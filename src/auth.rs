//! Credential store
//!
//! Secrets are kept only as Argon2 PHC hashes with per-user random
//! salts; verification goes through the library's constant-time check.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use tracing::info;

use crate::error::AppError;

/// Account registry consulted at login
///
/// Both calls are CPU-heavy; run them off the async executor.
pub trait CredentialStore: Send + Sync {
    /// Create an account; `UsernameTaken` if it exists
    fn register(&self, username: &str, secret: &str) -> Result<(), AppError>;

    /// Check a secret; `InvalidCredentials` on any mismatch
    fn verify(&self, username: &str, secret: &str) -> Result<(), AppError>;
}

/// In-memory Argon2 credential store
#[derive(Debug)]
pub struct Argon2Store {
    params: Params,
    /// username → PHC hash string
    users: RwLock<HashMap<String, String>>,
}

impl Default for Argon2Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Argon2Store {
    /// Store using the library's default cost parameters
    pub fn new() -> Self {
        Self::with_params(Params::default())
    }

    pub fn with_params(params: Params) -> Self {
        Self {
            params,
            users: RwLock::new(HashMap::new()),
        }
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Registered usernames, sorted
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for Argon2Store {
    fn register(&self, username: &str, secret: &str) -> Result<(), AppError> {
        if self.read().contains_key(username) {
            return Err(AppError::UsernameTaken(username.to_string()));
        }

        // Hash outside the lock
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| AppError::Credentials(e.to_string()))?
            .to_string();

        // Re-check under the write lock: a concurrent registration may have won
        let mut users = self.write();
        if users.contains_key(username) {
            return Err(AppError::UsernameTaken(username.to_string()));
        }
        users.insert(username.to_string(), hash);
        drop(users);

        info!("User '{}' registered", username);
        Ok(())
    }

    fn verify(&self, username: &str, secret: &str) -> Result<(), AppError> {
        let Some(stored) = self.read().get(username).cloned() else {
            return Err(AppError::InvalidCredentials);
        };
        let parsed = PasswordHash::new(&stored).map_err(|e| AppError::Credentials(e.to_string()))?;
        self.hasher()
            .verify_password(secret.as_bytes(), &parsed)
            .map_err(|_| AppError::InvalidCredentials)
    }
}
