//! Client configuration.
//!
//! Options can be built in code, through [`ClientBuilder`](crate::ClientBuilder), or
//! loaded from TOML. Durations are written in milliseconds:
//!
//! ```toml
//! address = "localhost:27017"
//! app_name = "reporting"
//! request_timeout_ms = 5000
//!
//! [pool]
//! max_pool_size = 20
//! min_pool_size = 2
//! checkout_timeout_ms = 2000
//! max_idle_time_ms = 60000
//!
//! [connect]
//! connect_timeout_ms = 3000
//! compressors = ["zstd", "zlib"]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{DriverError, DriverResult};
use crate::protocol::{CompressorRegistry, MAX_MESSAGE_SIZE};

pub const DEFAULT_PORT: u16 = 27017;

/// Host and port of the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, optionally prefixed with a `scheme://` and followed by
    /// a path or query, which are ignored.
    pub fn parse(input: &str) -> DriverResult<Self> {
        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("mongodb://{input}")
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| DriverError::Config(format!("invalid address {input:?}: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DriverError::Config(format!("address {input:?} has no host")))?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    /// How long `checkout` waits for capacity; `None` waits forever.
    #[serde(rename = "checkout_timeout_ms", with = "duration_ms::option")]
    pub checkout_timeout: Option<Duration>,
    /// Idle connections older than this are closed; `None` keeps them.
    #[serde(rename = "max_idle_time_ms", with = "duration_ms::option")]
    pub max_idle_time: Option<Duration>,
    #[serde(rename = "maintenance_interval_ms", with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// Upper bound on how long `close_all` waits for checked-out connections.
    #[serde(rename = "drain_timeout_ms", with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_pool_size: 0,
            checkout_timeout: Some(Duration::from_secs(30)),
            max_idle_time: Some(Duration::from_secs(300)),
            maintenance_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> DriverResult<()> {
        if self.max_pool_size == 0 {
            return Err(DriverError::Config(
                "max_pool_size must be at least 1".to_string(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(DriverError::Config(format!(
                "min_pool_size {} exceeds max_pool_size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(DriverError::Config(
                "maintenance_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// PEM file with the CA certificates to trust.
    pub ca_file: Option<PathBuf>,
    /// Name to verify the server certificate against; defaults to the host.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    /// Compressors to offer in the handshake, in preference order.
    pub compressors: Vec<String>,
    /// Append CRC-32C checksums to outgoing uncompressed messages.
    pub checksum: bool,
    pub tls: Option<TlsOptions>,
    /// Compressors this client can use; names in `compressors` must be registered here.
    #[serde(skip)]
    pub registry: CompressorRegistry,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: MAX_MESSAGE_SIZE,
            compressors: Vec::new(),
            checksum: false,
            tls: None,
            registry: CompressorRegistry::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub address: String,
    pub app_name: Option<String>,
    /// Deadline for a single command round trip; `None` waits forever.
    #[serde(rename = "request_timeout_ms", with = "duration_ms::option")]
    pub request_timeout: Option<Duration>,
    /// Deadline for each cursor `getMore`; falls back to `request_timeout`.
    #[serde(rename = "get_more_timeout_ms", with = "duration_ms::option")]
    pub get_more_timeout: Option<Duration>,
    pub pool: PoolOptions,
    pub connect: ConnectOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: format!("localhost:{DEFAULT_PORT}"),
            app_name: None,
            request_timeout: Some(Duration::from_secs(30)),
            get_more_timeout: None,
            pool: PoolOptions::default(),
            connect: ConnectOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> DriverResult<Self> {
        let options: ClientOptions =
            toml::from_str(input).map_err(|e| DriverError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DriverResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn server_address(&self) -> DriverResult<ServerAddress> {
        ServerAddress::parse(&self.address)
    }

    pub fn validate(&self) -> DriverResult<()> {
        self.server_address()?;
        self.pool.validate()
    }
}

/// Serde helpers reading durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(
            de: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
        }
    }
}
