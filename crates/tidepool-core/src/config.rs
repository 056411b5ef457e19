//! tidepool.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::options::ClientOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TidepoolConfig {
    pub client: Option<ClientConfig>,
    pub logging: Option<LoggingConfig>,
}

/// `[client]` table. Numeric fields are signed so that out-of-range values
/// reach option validation instead of failing as TOML type errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub uri: Option<String>,
    pub max_pool_size: Option<i64>,
    pub connect_timeout_ms: Option<i64>,
    pub socket_timeout_ms: Option<i64>,
    pub wait_queue_timeout_ms: Option<i64>,
    pub max_idle_time_ms: Option<i64>,
    pub socket_keepalive: Option<bool>,
    /// `"always"`, `"never"`, or a millisecond threshold as a string.
    pub liveness_check: Option<String>,
    /// Any further connection-string options, applied last.
    pub options: Option<BTreeMap<String, toml::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive string.
    pub filter: Option<String>,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: Option<bool>,
}

impl TidepoolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TidepoolConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build client options: start from `uri_override`, else `[client].uri`,
    /// else defaults, then apply the table's fields on top.
    pub fn client_options(&self, uri_override: Option<&str>) -> Result<ClientOptions> {
        let client = self.client.clone().unwrap_or_default();

        let mut options = match uri_override.or(client.uri.as_deref()) {
            Some(uri) => ClientOptions::parse(uri)?,
            None => ClientOptions::default(),
        };

        let numeric = [
            ("maxPoolSize", client.max_pool_size),
            ("connectTimeoutMS", client.connect_timeout_ms),
            ("socketTimeoutMS", client.socket_timeout_ms),
            ("waitQueueTimeoutMS", client.wait_queue_timeout_ms),
            ("maxIdleTimeMS", client.max_idle_time_ms),
        ];
        for (key, value) in numeric {
            if let Some(value) = value {
                options.set(key, &value.to_string())?;
            }
        }
        if let Some(keepalive) = client.socket_keepalive {
            options.socket_keepalive = keepalive;
        }
        if let Some(check) = &client.liveness_check {
            options.set("livenessCheck", check)?;
        }
        for (key, value) in client.options.iter().flatten() {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            options.set(key, &value)?;
        }

        options.validate()?;
        Ok(options)
    }

    /// Log filter directive, defaulting to `info`.
    pub fn log_filter(&self) -> String {
        self.logging
            .as_ref()
            .and_then(|l| l.filter.clone())
            .unwrap_or_else(|| "info".to_string())
    }
}
