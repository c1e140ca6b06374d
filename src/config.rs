//! Runtime options assembled from the command line
//!
//! Everything the proxy needs is passed as flags; the only files read at
//! startup are the credential archive and the route table. Options are
//! validated once, before any socket is bound.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rustls::SupportedProtocolVersion;

/// Configuration failures; all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required flag was not supplied.
    #[error("missing required flag --{0}")]
    MissingFlag(&'static str),

    /// The bind address is not a `host:port` socket address.
    #[error("invalid bind address '{addr}': {source}")]
    InvalidBind {
        /// Offending value.
        addr: String,
        /// Parse failure.
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Minimum TLS protocol version enforced on inbound connections.
///
/// The flag encoding is historical: `0` and `1` select TLS 1.0, `2`
/// selects 1.1 and `3` selects 1.2, any other value falling back to 1.0.
/// The TLS backend only speaks 1.2 and newer, so floors below 1.2 clamp
/// to 1.2; [`MinTlsVersion::is_clamped`] lets startup log that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTlsVersion {
    /// TLS 1.0 floor (clamped to 1.2).
    Tls10,
    /// TLS 1.1 floor (clamped to 1.2).
    Tls11,
    /// TLS 1.2 floor.
    Tls12,
}

impl MinTlsVersion {
    /// Decode the numeric flag value.
    pub fn from_flag(value: u32) -> Self {
        match value {
            2 => MinTlsVersion::Tls11,
            3 => MinTlsVersion::Tls12,
            _ => MinTlsVersion::Tls10,
        }
    }

    /// Protocol versions to enable, newest last.
    pub fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        // All floors resolve to the same set until the backend grows
        // pre-1.2 support, which it never will.
        static VERSIONS: [&SupportedProtocolVersion; 2] =
            [&rustls::version::TLS12, &rustls::version::TLS13];
        &VERSIONS
    }

    /// Whether the requested floor is below what the backend can enforce.
    pub fn is_clamped(self) -> bool {
        !matches!(self, MinTlsVersion::Tls12)
    }

    /// Human-readable floor actually in force.
    pub fn effective(self) -> &'static str {
        "TLS1.2"
    }

    /// Human-readable floor as requested.
    pub fn requested(self) -> &'static str {
        match self {
            MinTlsVersion::Tls10 => "TLS1.0",
            MinTlsVersion::Tls11 => "TLS1.1",
            MinTlsVersion::Tls12 => "TLS1.2",
        }
    }
}

/// Validated proxy options.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Credential archive location.
    pub keystore: PathBuf,
    /// Socket address to listen on.
    pub bind: SocketAddr,
    /// Route table location.
    pub routes: PathBuf,
    /// Minimum inbound TLS version.
    pub min_tls: MinTlsVersion,
    /// Credential reload cadence.
    pub reload_interval: Duration,
}

impl ProxyOptions {
    /// Validate raw flag values into options.
    pub fn from_flags(
        keystore: Option<PathBuf>,
        bind: &str,
        routes: Option<PathBuf>,
        min_tls_ver: u32,
        reload_interval_secs: u64,
    ) -> Result<Self, ConfigError> {
        let keystore = keystore.ok_or(ConfigError::MissingFlag("keystore"))?;
        let routes = routes.ok_or(ConfigError::MissingFlag("routes"))?;
        let bind = bind.parse().map_err(|source| ConfigError::InvalidBind {
            addr: bind.to_string(),
            source,
        })?;
        Ok(Self {
            keystore,
            bind,
            routes,
            min_tls: MinTlsVersion::from_flag(min_tls_ver),
            reload_interval: Duration::from_secs(reload_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_tls_flag_decoding() {
        assert_eq!(MinTlsVersion::from_flag(0), MinTlsVersion::Tls10);
        assert_eq!(MinTlsVersion::from_flag(1), MinTlsVersion::Tls10);
        assert_eq!(MinTlsVersion::from_flag(2), MinTlsVersion::Tls11);
        assert_eq!(MinTlsVersion::from_flag(3), MinTlsVersion::Tls12);
        // Anything else falls back to the 1.0 floor.
        assert_eq!(MinTlsVersion::from_flag(7), MinTlsVersion::Tls10);
    }

    #[test]
    fn sub_tls12_floors_are_clamped() {
        assert!(MinTlsVersion::Tls10.is_clamped());
        assert!(MinTlsVersion::Tls11.is_clamped());
        assert!(!MinTlsVersion::Tls12.is_clamped());
    }

    #[test]
    fn options_validation() {
        let ok = ProxyOptions::from_flags(
            Some(PathBuf::from("/tmp/ks")),
            "127.0.0.1:8443",
            Some(PathBuf::from("/tmp/routes.json")),
            3,
            1800,
        )
        .unwrap();
        assert_eq!(ok.min_tls, MinTlsVersion::Tls12);
        assert_eq!(ok.reload_interval, Duration::from_secs(1800));

        let missing = ProxyOptions::from_flags(None, "127.0.0.1:8443", None, 3, 1800);
        assert!(matches!(
            missing.unwrap_err(),
            ConfigError::MissingFlag("keystore")
        ));

        let bad_bind = ProxyOptions::from_flags(
            Some(PathBuf::from("/tmp/ks")),
            "not-an-addr",
            Some(PathBuf::from("/tmp/routes.json")),
            1,
            60,
        );
        assert!(matches!(
            bad_bind.unwrap_err(),
            ConfigError::InvalidBind { .. }
        ));
    }
}
