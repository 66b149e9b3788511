use super::CredentialVerifier;
use super::pool::ConnPool;
use crate::error::{EtudeError, EtudeResult};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One handle onto the user table.
pub trait UserBackend: Send {
    /// The stored PHC hash for `username`, if the user exists.
    fn password_hash(&mut self, username: &str) -> EtudeResult<Option<String>>;

    /// Insert a new user. `Ok(false)` when the name is already taken.
    fn insert_user(&mut self, username: &str, hash: &str) -> EtudeResult<bool>;
}

/// Process-local user table. Clones share the same table, so a pool of
/// clones behaves like a pool of connections to one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handles(&self, count: usize) -> Vec<Self> {
        (0..count).map(|_| self.clone()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl UserBackend for MemoryBackend {
    fn password_hash(&mut self, username: &str) -> EtudeResult<Option<String>> {
        Ok(self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned())
    }

    fn insert_user(&mut self, username: &str, hash: &str) -> EtudeResult<bool> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), hash.to_string());
        Ok(true)
    }
}

/// Login/register logic over pooled backend handles.
pub struct UserStore<B> {
    pool: ConnPool<B>,
    hasher: Argon2<'static>,
}

impl UserStore<MemoryBackend> {
    pub fn in_memory(pool_size: usize) -> Self {
        Self::new(MemoryBackend::new().handles(pool_size))
    }
}

impl<B: UserBackend> UserStore<B> {
    pub fn new(handles: Vec<B>) -> Self {
        Self::with_hasher(handles, Argon2::default())
    }

    pub fn with_hasher(handles: Vec<B>, hasher: Argon2<'static>) -> Self {
        info!(pool_size = handles.len(), "credential store ready");
        Self {
            pool: ConnPool::new(handles),
            hasher,
        }
    }

    pub fn pool(&self) -> &ConnPool<B> {
        &self.pool
    }

    fn check(&self, username: &str, password: &str, is_login: bool) -> EtudeResult<bool> {
        let mut conn = self.pool.get();
        let stored = conn.password_hash(username)?;

        match (is_login, stored) {
            (true, Some(hash)) => {
                let ok = self.verify_hash(password, &hash)?;
                if !ok {
                    debug!(username, "password mismatch");
                }
                Ok(ok)
            }
            (true, None) => {
                debug!(username, "unknown user");
                Ok(false)
            }
            (false, Some(_)) => {
                debug!(username, "user name already taken");
                Ok(false)
            }
            (false, None) => {
                let hash = self.hash(password)?;
                let inserted = conn.insert_user(username, &hash)?;
                if inserted {
                    debug!(username, "user registered");
                }
                Ok(inserted)
            }
        }
    }

    fn hash(&self, password: &str) -> EtudeResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| EtudeError::Auth(format!("failed to hash password: {}", e)))
    }

    fn verify_hash(&self, password: &str, hash: &str) -> EtudeResult<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| EtudeError::Auth(format!("invalid password hash: {}", e)))?;
        Ok(self
            .hasher
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

impl<B: UserBackend> CredentialVerifier for UserStore<B> {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        match self.check(username, password, is_login) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "credential check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{Algorithm, Params, Version};

    fn fast_store(backend: &MemoryBackend) -> UserStore<MemoryBackend> {
        let params = Params::new(Params::MIN_M_COST, 1, 1, None).unwrap();
        UserStore::with_hasher(
            backend.handles(2),
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        )
    }

    struct BrokenBackend;

    impl UserBackend for BrokenBackend {
        fn password_hash(&mut self, _: &str) -> EtudeResult<Option<String>> {
            Err(EtudeError::Auth("store unavailable".into()))
        }

        fn insert_user(&mut self, _: &str, _: &str) -> EtudeResult<bool> {
            Err(EtudeError::Auth("store unavailable".into()))
        }
    }

    #[test]
    fn register_then_login() {
        let backend = MemoryBackend::new();
        let store = fast_store(&backend);

        assert!(!store.verify("alice", "secret", true));
        assert!(store.verify("alice", "secret", false));
        assert_eq!(backend.user_count(), 1);

        assert!(store.verify("alice", "secret", true));
        assert!(!store.verify("alice", "wrong", true));
    }

    #[test]
    fn duplicate_register_fails() {
        let backend = MemoryBackend::new();
        let store = fast_store(&backend);
        assert!(store.verify("bob", "pw", false));
        assert!(!store.verify("bob", "other", false));
        assert!(store.verify("bob", "pw", true));
    }

    #[test]
    fn empty_credentials_fail() {
        let store = fast_store(&MemoryBackend::new());
        assert!(!store.verify("", "pw", false));
        assert!(!store.verify("carol", "", false));
    }

    #[test]
    fn backend_failure_is_rejection() {
        let store = UserStore::new(vec![BrokenBackend]);
        assert!(!store.verify("dave", "pw", true));
        assert!(!store.verify("dave", "pw", false));
        assert_eq!(store.pool().free_count(), 1);
    }

    #[test]
    fn stored_passwords_are_hashed() {
        let backend = MemoryBackend::new();
        let store = fast_store(&backend);
        assert!(store.verify("erin", "hunter2", false));
        let hash = backend.clone().password_hash("erin").unwrap().unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("hunter2"));
    }
}
