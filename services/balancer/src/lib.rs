//! plfm-vt balancer library.
//!
//! Byte-transparent TCP load balancer. The binary is a thin wrapper; tests
//! drive the same [`Server`] it runs.

pub mod config;
pub mod proxy;

pub use config::{Config, ConfigError};
pub use proxy::{BackendTarget, ProxyContext, Server, ServerStats};
