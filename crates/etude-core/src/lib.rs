// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("etude-core drives epoll directly and only builds on Linux");

pub mod auth;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use auth::{CredentialVerifier, UserStore};
pub use buffer::Buffer;
pub use config::{Config, Dispatch};
pub use error::{EtudeError, EtudeResult};
pub use http::{FormDecoding, Method, Request};
pub use logging::init_logging;
pub use parser::RequestParser;
pub use pool::WorkerPool;
pub use reactor::{Reactor, ReactorHandle};
pub use response::{Responder, StaticFiles};
pub use server::Server;
pub use timer::TimerHeap;
