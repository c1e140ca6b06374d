//! SillyProxy - SNI-aware TLS-terminating reverse proxy
//!
//! A reverse proxy that:
//! - Terminates TLS for many virtual hosts, picking the certificate per
//!   handshake from the client's SNI and offered cipher suites
//! - Holds its credentials in a password-protected JKS archive and
//!   refreshes the in-memory snapshot on a fixed cadence
//! - Routes requests through a declarative host + method + path table
//!   and rebuilds the backend URL from a parameterised template
//! - Forwards over a shared pooled client that never follows redirects

pub mod config;
pub mod credentials;
pub mod forwarder;
pub mod keystore;
pub mod routes;
pub mod selector;
pub mod server;
pub mod template;

// Re-export commonly used types
pub use config::{ConfigError, MinTlsVersion, ProxyOptions};
pub use credentials::{CredentialStore, CredentialsHandle, KeyAlgorithm};
pub use forwarder::Forwarder;
pub use routes::{RouteSpec, RouterTable};
pub use selector::SniCertSelector;
pub use server::ProxyContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
