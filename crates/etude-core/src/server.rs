// src/server.rs
use crate::auth::{CredentialVerifier, UserStore};
use crate::config::{Config, Dispatch};
use crate::error::{EtudeError, EtudeResult};
use crate::reactor::Reactor;
use crate::response::{Responder, StaticFiles};
use crate::syscalls;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Builder that wires a [`Config`] and the two collaborators into a
/// [`Reactor`].
///
/// Without explicit collaborators the server serves files from
/// `resource_dir` and keeps users in an in-memory argon2 store.
pub struct Server {
    config: Config,
    responder: Option<Arc<dyn Responder>>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            responder: None,
            verifier: None,
        }
    }

    /// Start from defaults listening on `host_port`.
    pub fn bind(host_port: &str) -> EtudeResult<Self> {
        let addr = resolve(host_port)?;
        Ok(Self::new(Config {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Config::default()
        }))
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn trigger_mode(mut self, mode: u8) -> Self {
        self.config.trigger_mode = mode;
        self
    }

    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn credential_pool(mut self, size: usize) -> Self {
        self.config.credential_pool_size = size;
        self
    }

    pub fn resource_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.resource_dir = dir.into();
        self
    }

    pub fn responder<R: Responder + 'static>(mut self, responder: R) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    pub fn verifier<V: CredentialVerifier + 'static>(mut self, verifier: V) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate the configuration, bind the listening socket and construct
    /// the reactor without running it.
    pub fn build(self) -> EtudeResult<Reactor> {
        let cfg = self.config;
        cfg.validate()?;

        let addr = resolve(&cfg.addr())?;
        let listener = syscalls::create_listen_socket(addr, cfg.linger)?;

        let responder = match self.responder {
            Some(r) => r,
            None => {
                if !cfg.resource_dir.is_dir() {
                    warn!(dir = %cfg.resource_dir.display(), "resource directory not found");
                }
                Arc::new(StaticFiles::new(cfg.resource_dir.clone()))
            }
        };
        let verifier = match self.verifier {
            Some(v) => v,
            None => Arc::new(UserStore::in_memory(cfg.credential_pool_size)),
        };

        let reactor = Reactor::new(listener, &cfg, responder, verifier)?;
        info!(
            addr = %reactor.local_addr()?,
            trigger_mode = cfg.trigger_mode,
            timeout_ms = cfg.timeout_ms,
            workers = cfg.workers,
            dispatch = ?cfg.dispatch,
            "server listening"
        );
        Ok(reactor)
    }

    /// Build and run until the reactor's handle requests shutdown.
    pub fn serve(self) -> EtudeResult<()> {
        let mut reactor = self.build()?;
        reactor.run()?;
        Ok(())
    }
}

fn resolve(host_port: &str) -> EtudeResult<SocketAddr> {
    host_port
        .to_socket_addrs()
        .map_err(|e| EtudeError::Config(format!("invalid address `{}`: {}", host_port, e)))?
        .next()
        .ok_or_else(|| EtudeError::Config(format!("`{}` resolved to no address", host_port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_parses_address() {
        let server = Server::bind("127.0.0.1:8080").unwrap().workers(3);
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 8080);
        assert_eq!(server.config().workers, 3);
        assert!(Server::bind("not an address").is_err());
    }

    #[test]
    fn build_rejects_invalid_config() {
        let err = Server::bind("127.0.0.1:0")
            .unwrap()
            .trigger_mode(9)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EtudeError::Config(_)));
    }

    #[test]
    fn build_binds_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let reactor = Server::bind("127.0.0.1:0")
            .unwrap()
            .workers(1)
            .credential_pool(1)
            .resource_dir(dir.path())
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_ne!(reactor.local_addr().unwrap().port(), 0);
        assert_eq!(reactor.connections(), 0);
    }
}
