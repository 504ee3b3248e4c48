//! # Server Options
//!
//! The configuration table of a [`Server`](super::Server). Keys use the camelCase names of the
//! option table (`tcpNoDelay`, `keepAlive`, ...) so that a TOML or JSON document can be
//! deserialized directly, and every key is optional.
//!
//! ```toml
//! tcpNoDelay = true
//! sendBufferSize = 65536
//! writeHighWaterMark = 131072
//!
//! [tls]
//! tls = true
//! keyStorePath = "server.pem"
//! clientAuth = "REQUEST"
//! trustStorePath = "ca.pem"
//! ```
//!
//! TLS settings live in a nested [`TlsOptions`] value rather than being mixed into the
//! socket options.

use crate::error::NetError;
use serde::Deserialize;
use socket2::SockRef;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

pub const DEFAULT_WRITE_HIGH_WATER_MARK: usize = 64 * 1024;
pub const DEFAULT_WRITE_LOW_WATER_MARK: usize = 32 * 1024;
pub const DEFAULT_ACCEPT_BACKLOG: u32 = 1024;

/// Socket options applied to the listening endpoint and to every accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ServerOptions {
    pub tcp_no_delay: bool,
    pub keep_alive: bool,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    /// Applies to the accepting endpoint only.
    pub reuse_address: bool,
    pub so_linger: bool,
    /// Linger timeout used when `so_linger` is set.
    pub so_linger_secs: u64,
    /// IP type-of-service byte.
    pub traffic_class: Option<u32>,
    pub write_high_water_mark: usize,
    pub write_low_water_mark: usize,
    pub accept_backlog: u32,
    pub tls: TlsOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tcp_no_delay: true,
            keep_alive: true,
            send_buffer_size: None,
            receive_buffer_size: None,
            reuse_address: true,
            so_linger: false,
            so_linger_secs: 0,
            traffic_class: None,
            write_high_water_mark: DEFAULT_WRITE_HIGH_WATER_MARK,
            write_low_water_mark: DEFAULT_WRITE_LOW_WATER_MARK,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            tls: TlsOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Parses a TOML table. Omitted keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, NetError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks watermark ordering and TLS consistency.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.write_high_water_mark == 0 {
            return Err(NetError::Config(
                "writeHighWaterMark must be greater than zero".into(),
            ));
        }
        if self.write_low_water_mark > self.write_high_water_mark {
            return Err(NetError::Config(format!(
                "writeLowWaterMark ({}) exceeds writeHighWaterMark ({})",
                self.write_low_water_mark, self.write_high_water_mark
            )));
        }
        self.tls.validate()
    }

    pub fn linger(&self) -> Option<Duration> {
        self.so_linger
            .then(|| Duration::from_secs(self.so_linger_secs))
    }

    /// Applies the per-connection options to an accepted stream.
    pub(crate) fn apply_to_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_no_delay)?;
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keep_alive)?;
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.receive_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        sock.set_linger(self.linger())?;
        if let Some(tos) = self.traffic_class {
            sock.set_tos(tos)?;
        }
        Ok(())
    }
}

/// How a TLS server treats client certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientAuth {
    /// No client certificate is requested.
    #[default]
    None,
    /// A certificate is requested; clients without one are still accepted.
    Request,
    /// The handshake fails without a valid client certificate.
    Required,
}

/// TLS wrapper configuration.
///
/// Key and trust stores are PEM files. The key store holds the server certificate chain
/// and its private key; the trust store holds the CA certificates used to verify clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TlsOptions {
    pub tls: bool,
    pub key_store_path: Option<PathBuf>,
    /// Accepted for compatibility; PEM stores are read unencrypted.
    pub key_store_password: Option<String>,
    pub trust_store_path: Option<PathBuf>,
    /// Accepted for compatibility; PEM stores are read unencrypted.
    pub trust_store_password: Option<String>,
    pub client_auth: ClientAuth,
}

impl TlsOptions {
    pub fn validate(&self) -> Result<(), NetError> {
        if !self.tls {
            return Ok(());
        }
        if self.key_store_path.is_none() {
            return Err(NetError::TlsConfig(
                "keyStorePath is required when tls is enabled".into(),
            ));
        }
        if self.client_auth != ClientAuth::None && self.trust_store_path.is_none() {
            return Err(NetError::TlsConfig(format!(
                "trustStorePath is required when clientAuth is {:?}",
                self.client_auth
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServerOptions::default();
        assert!(options.tcp_no_delay);
        assert!(options.keep_alive);
        assert!(options.reuse_address);
        assert!(!options.tls.tls);
        assert_eq!(options.tls.client_auth, ClientAuth::None);
        assert_eq!(options.linger(), None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_toml_with_camel_case_keys() {
        let options = ServerOptions::from_toml_str(
            r#"
            tcpNoDelay = false
            sendBufferSize = 8192
            soLinger = true
            soLingerSecs = 3
            trafficClass = 16

            [tls]
            tls = true
            keyStorePath = "server.pem"
            keyStorePassword = "secret"
            clientAuth = "REQUIRED"
            trustStorePath = "ca.pem"
            "#,
        )
        .expect("options should parse");

        assert!(!options.tcp_no_delay);
        assert!(options.keep_alive);
        assert_eq!(options.send_buffer_size, Some(8192));
        assert_eq!(options.linger(), Some(Duration::from_secs(3)));
        assert_eq!(options.traffic_class, Some(16));
        assert_eq!(options.tls.client_auth, ClientAuth::Required);
        assert_eq!(options.tls.key_store_path, Some(PathBuf::from("server.pem")));
    }

    #[test]
    fn test_unknown_key_is_a_config_error() {
        let err = ServerOptions::from_toml_str("tcpNoDelya = true").unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let options = ServerOptions {
            write_high_water_mark: 10,
            write_low_water_mark: 20,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(NetError::Config(_))));
    }

    #[test]
    fn test_validate_requires_stores() {
        let mut options = ServerOptions::default();
        options.tls.tls = true;
        assert!(matches!(options.validate(), Err(NetError::TlsConfig(_))));

        options.tls.key_store_path = Some("server.pem".into());
        assert!(options.validate().is_ok());

        options.tls.client_auth = ClientAuth::Request;
        assert!(matches!(options.validate(), Err(NetError::TlsConfig(_))));
    }
}
