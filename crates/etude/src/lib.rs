// src/lib.rs
pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod error;
pub mod file;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod response;
pub mod server;
pub mod signal;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::{Cli, Config, LogFormat};
pub use error::{EtudeError, EtudeResult};
pub use logging::init_logging;
pub use metrics::{Metrics, MetricsSnapshot, ServerContext};
pub use server::Server;
pub use signal::ShutdownHandle;
