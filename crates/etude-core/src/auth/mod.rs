//! Credential verification used by the login and register pages.
//!
//! The parser only sees [`CredentialVerifier`]. The bundled implementation,
//! [`UserStore`], checks argon2 password hashes held by a [`UserBackend`],
//! borrowing backend handles from a bounded [`ConnPool`] the way a SQL
//! client borrows connections.
//!
//! Verification is a blocking call and runs on worker threads, never on the
//! reactor thread. Every backend failure collapses to `false`.

pub mod pool;
pub mod store;

pub use pool::{ConnPool, PooledConn};
pub use store::{MemoryBackend, UserBackend, UserStore};

pub trait CredentialVerifier: Send + Sync {
    /// `is_login` selects login (user must exist, password must match)
    /// versus register (user must not exist yet).
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool;
}

impl<F> CredentialVerifier for F
where
    F: Fn(&str, &str, bool) -> bool + Send + Sync,
{
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        self(username, password, is_login)
    }
}
