//! Client options: typed, validated configuration for a tidepool client.
//!
//! Options arrive from three sources that all funnel through the same
//! validation: a connection string ([`ClientOptions::parse`]), string
//! key/value pairs ([`ClientOptions::set`], used by the URI parser and the
//! TOML config file), or direct struct construction followed by
//! [`ClientOptions::validate`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bson::spec::BinarySubtype;
use bson::{Bson, Document, doc};

use crate::error::{DriverError, Result};

/// Default MongoDB port.
pub const DEFAULT_PORT: u16 = 27017;

/// Default maximum connections per server pool.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// Default connect timeout (matches the server-side default of other drivers).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default idle duration after which a pooled socket is probed before reuse.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

// ── ServerAddress ────────────────────────────────────────────────────

/// Address of a single server: a TCP host/port or a Unix-domain socket path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl ServerAddress {
    /// Parse `host`, `host:port`, `[v6addr]:port`, or an absolute socket path.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(DriverError::config("empty host in connection string"));
        }
        if input.starts_with('/') {
            return Ok(ServerAddress::Unix {
                path: PathBuf::from(input),
            });
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| DriverError::config(format!("unterminated IPv6 literal: {input}")))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => {
                    return Err(DriverError::config(format!("invalid host: {input}")));
                }
            };
            (host, port)
        } else {
            match input.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(DriverError::config(format!("empty host in '{input}'")));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| {
                DriverError::config(format!("port must be an integer in 1..=65535, got '{p}'"))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(ServerAddress::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        ServerAddress::Tcp {
            host: host.to_string(),
            port,
        }
    }

    /// Host name used for TLS server-name indication (none for Unix sockets).
    pub fn host(&self) -> Option<&str> {
        match self {
            ServerAddress::Tcp { host, .. } => Some(host),
            ServerAddress::Unix { .. } => None,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            ServerAddress::Tcp { host, port } => write!(f, "{host}:{port}"),
            ServerAddress::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

// ── LivenessCheck ────────────────────────────────────────────────────

/// Policy deciding when an idle pooled connection is probed before reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessCheck {
    /// Probe every idle connection before reuse.
    Always,
    /// Trust the socket; never probe.
    Never,
    /// Probe connections that sat idle at least this long.
    Interval(Duration),
}

impl LivenessCheck {
    /// Whether a connection idle for `idle_for` must be probed.
    pub fn is_due(&self, idle_for: Duration) -> bool {
        match self {
            LivenessCheck::Always => true,
            LivenessCheck::Never => false,
            LivenessCheck::Interval(threshold) => idle_for >= *threshold,
        }
    }

    /// Parse `always`, `never`, or a number of milliseconds.
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "always" => Ok(LivenessCheck::Always),
            "never" => Ok(LivenessCheck::Never),
            other => other
                .parse::<u64>()
                .map(|ms| LivenessCheck::Interval(Duration::from_millis(ms)))
                .map_err(|_| {
                    DriverError::config(format!(
                        "livenessCheck must be 'always', 'never', or milliseconds, got '{value}'"
                    ))
                }),
        }
    }
}

impl Default for LivenessCheck {
    fn default() -> Self {
        LivenessCheck::Interval(DEFAULT_CHECK_INTERVAL)
    }
}

// ── UuidRepresentation ───────────────────────────────────────────────

/// How UUIDs are encoded as BSON binary values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UuidRepresentation {
    /// RFC 4122 byte order, binary subtype 4.
    Standard,
    /// Legacy Python driver byte order, binary subtype 3.
    #[default]
    PythonLegacy,
    /// Legacy Java driver byte order, binary subtype 3.
    JavaLegacy,
    /// Legacy C# driver byte order, binary subtype 3.
    CSharpLegacy,
}

impl UuidRepresentation {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "standard" => Ok(UuidRepresentation::Standard),
            "pythonlegacy" => Ok(UuidRepresentation::PythonLegacy),
            "javalegacy" => Ok(UuidRepresentation::JavaLegacy),
            "csharplegacy" => Ok(UuidRepresentation::CSharpLegacy),
            _ => Err(DriverError::config(format!(
                "uuidRepresentation must be one of standard, pythonLegacy, javaLegacy, csharpLegacy; got '{value}'"
            ))),
        }
    }

    /// BSON binary subtype used when encoding UUIDs with this representation.
    pub fn binary_subtype(&self) -> BinarySubtype {
        match self {
            UuidRepresentation::Standard => BinarySubtype::Uuid,
            _ => BinarySubtype::UuidOld,
        }
    }
}

// ── Credential ───────────────────────────────────────────────────────

/// Credentials parsed from the connection string.
///
/// Authentication itself is handled elsewhere; the driver core only carries them.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: Option<String>,
    /// Database the user is defined in (`authSource`, else the URI database).
    pub source: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .finish()
    }
}

// ── TlsOptions ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub enabled: bool,
    /// PEM file with additional trusted roots.
    pub ca_file: Option<PathBuf>,
    /// Skip certificate verification. For test deployments only.
    pub allow_invalid_certificates: bool,
}

// ── WriteConcern ─────────────────────────────────────────────────────

/// The `w` component of a write concern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgment {
    Nodes(u32),
    Majority,
    Tag(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteConcern {
    pub w: Option<Acknowledgment>,
    pub journal: Option<bool>,
    pub w_timeout: Option<Duration>,
}

impl WriteConcern {
    /// `w: 0` writes are fire-and-forget: no server reply is read.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0))
    }

    /// The `writeConcern` sub-document for write commands, if any field is set.
    pub fn to_document(&self) -> Option<Document> {
        if self.w.is_none() && self.journal.is_none() && self.w_timeout.is_none() {
            return None;
        }
        let mut wc = Document::new();
        match &self.w {
            Some(Acknowledgment::Nodes(n)) => {
                wc.insert("w", Bson::Int32(*n as i32));
            }
            Some(Acknowledgment::Majority) => {
                wc.insert("w", "majority");
            }
            Some(Acknowledgment::Tag(tag)) => {
                wc.insert("w", tag.as_str());
            }
            None => {}
        }
        if let Some(j) = self.journal {
            wc.insert("j", j);
        }
        if let Some(t) = self.w_timeout {
            wc.insert("wtimeout", Bson::Int64(t.as_millis() as i64));
        }
        Some(wc)
    }
}

// ── ClientOptions ────────────────────────────────────────────────────

/// Complete configuration of a client.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Seed list; the first host answering as primary becomes the primary pool.
    pub hosts: Vec<ServerAddress>,
    /// Database named in the URI path.
    pub default_database: Option<String>,
    pub credential: Option<Credential>,
    /// Maximum connections per server pool (must be positive).
    pub max_pool_size: u32,
    /// Limit on TCP connect + TLS handshake. DNS resolution is not charged.
    pub connect_timeout: Option<Duration>,
    /// Limit on each send and receive on an established connection.
    pub socket_timeout: Option<Duration>,
    /// Limit on waiting for a pooled connection when the pool is exhausted.
    pub wait_queue_timeout: Option<Duration>,
    /// Idle connections older than this are reaped.
    pub max_idle_time: Option<Duration>,
    pub socket_keepalive: bool,
    pub liveness_check: LivenessCheck,
    pub tls: TlsOptions,
    pub write_concern: WriteConcern,
    pub uuid_representation: UuidRepresentation,
    pub app_name: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: vec![ServerAddress::tcp("localhost", DEFAULT_PORT)],
            default_database: None,
            credential: None,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            socket_timeout: None,
            wait_queue_timeout: None,
            max_idle_time: None,
            socket_keepalive: false,
            liveness_check: LivenessCheck::default(),
            tls: TlsOptions::default(),
            write_concern: WriteConcern::default(),
            uuid_representation: UuidRepresentation::default(),
            app_name: None,
        }
    }
}

impl ClientOptions {
    /// Parse a `mongodb://` connection string.
    pub fn parse(uri: &str) -> Result<Self> {
        crate::uri::parse(uri)
    }

    /// Options for a single TCP host with everything else defaulted.
    pub fn for_host(host: &str, port: u16) -> Self {
        Self {
            hosts: vec![ServerAddress::tcp(host, port)],
            ..Self::default()
        }
    }

    /// Apply one string-typed option. Keys are case-insensitive and accept
    /// both the URI spelling (`maxPoolSize`) and snake case (`max_pool_size`).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "maxpoolsize" => self.max_pool_size = parse_pool_size(value)?,
            "connecttimeoutms" => self.connect_timeout = parse_millis(key, value)?,
            "sockettimeoutms" => self.socket_timeout = parse_millis(key, value)?,
            "waitqueuetimeoutms" => self.wait_queue_timeout = parse_millis(key, value)?,
            "maxidletimems" => self.max_idle_time = parse_millis(key, value)?,
            "socketkeepalive" => self.socket_keepalive = parse_bool(key, value)?,
            "livenesscheck" | "checkintervalms" => {
                self.liveness_check = LivenessCheck::parse(value)?;
            }
            "tls" | "ssl" => self.tls.enabled = parse_bool(key, value)?,
            "tlscafile" | "sslcacerts" => {
                self.tls.ca_file = Some(PathBuf::from(value));
                self.tls.enabled = true;
            }
            "tlsallowinvalidcertificates" | "sslallowinvalidcertificates" => {
                self.tls.allow_invalid_certificates = parse_bool(key, value)?;
            }
            "w" => {
                self.write_concern.w = Some(match value.parse::<i64>() {
                    Ok(n) if n >= 0 => Acknowledgment::Nodes(n as u32),
                    Ok(_) => {
                        return Err(DriverError::config(format!(
                            "w must be a non-negative integer or a tag, got '{value}'"
                        )));
                    }
                    Err(_) if value == "majority" => Acknowledgment::Majority,
                    Err(_) => Acknowledgment::Tag(value.to_string()),
                });
            }
            "journal" | "j" => self.write_concern.journal = Some(parse_bool(key, value)?),
            "wtimeoutms" => self.write_concern.w_timeout = parse_millis(key, value)?,
            "uuidrepresentation" => {
                self.uuid_representation = UuidRepresentation::parse(value)?;
            }
            "authsource" => match self.credential.as_mut() {
                Some(credential) => credential.source = Some(value.to_string()),
                None => {
                    return Err(DriverError::config(
                        "authSource given without a username in the connection string",
                    ));
                }
            },
            "appname" => self.app_name = Some(value.to_string()),
            // Accepted for compatibility; topology discovery is out of scope.
            "replicaset" | "readpreference" | "authmechanism" => {
                tracing::debug!(option = key, "ignoring option without driver-core support");
            }
            _ => {
                return Err(DriverError::config(format!("unknown option '{key}'")));
            }
        }
        Ok(())
    }

    /// Check cross-field invariants. Runs before any network I/O.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(DriverError::config("at least one host is required"));
        }
        if self.max_pool_size == 0 {
            return Err(DriverError::config(
                "maxPoolSize must be a positive integer, got 0",
            ));
        }
        if self.tls.enabled
            && self
                .hosts
                .iter()
                .any(|h| matches!(h, ServerAddress::Unix { .. }))
        {
            return Err(DriverError::config(
                "TLS cannot be used with Unix domain sockets",
            ));
        }
        if self
            .credential
            .as_ref()
            .is_some_and(|c| c.username.is_empty())
        {
            return Err(DriverError::config("username must not be empty"));
        }
        Ok(())
    }

    /// Binary subtype for UUID values under the configured representation.
    pub fn uuid_subtype(&self) -> BinarySubtype {
        self.uuid_representation.binary_subtype()
    }

    /// Client metadata document sent with the `ismaster` handshake.
    pub fn handshake_metadata(&self) -> Document {
        let mut client = doc! {
            "driver": { "name": "tidepool", "version": env!("CARGO_PKG_VERSION") },
            "os": { "type": std::env::consts::OS },
        };
        if let Some(name) = &self.app_name {
            client.insert("application", doc! { "name": name.as_str() });
        }
        client
    }
}

fn parse_pool_size(value: &str) -> Result<u32> {
    let n: i64 = value.trim().parse().map_err(|_| {
        DriverError::config(format!("maxPoolSize must be an integer, got '{value}'"))
    })?;
    if n <= 0 || n > u32::MAX as i64 {
        return Err(DriverError::config(format!(
            "maxPoolSize must be a positive integer, got {n}"
        )));
    }
    Ok(n as u32)
}

/// Milliseconds option; `0` means "no limit".
fn parse_millis(key: &str, value: &str) -> Result<Option<Duration>> {
    let ms: i64 = value.trim().parse().map_err(|_| {
        DriverError::config(format!("{key} must be an integer number of milliseconds, got '{value}'"))
    })?;
    match ms {
        0 => Ok(None),
        ms if ms > 0 => Ok(Some(Duration::from_millis(ms as u64))),
        ms => Err(DriverError::config(format!(
            "{key} must not be negative, got {ms}"
        ))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DriverError::config(format!(
            "{key} must be 'true' or 'false', got '{value}'"
        ))),
    }
}
