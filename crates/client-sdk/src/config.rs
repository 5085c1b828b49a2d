use serde::{Deserialize, Serialize};

use crate::ConsulError;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8500;

/// Connection settings for a [`crate::ConsulClient`].
///
/// Deserializes from `{"acl_token": .., "dc": .., "host": .., "port": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub acl_token: Option<String>,
    #[serde(default)]
    pub dc: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            acl_token: None,
            dc: None,
            host: default_host(),
            port: DEFAULT_PORT,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Reads `CONSUL_HTTP_TOKEN`, `CONSUL_DC`, `CONSUL_HOST` and `CONSUL_PORT`.
    pub fn from_env() -> Result<Self, ConsulError> {
        let port = match std::env::var("CONSUL_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConsulError::InvalidConfig(format!("invalid CONSUL_PORT: {raw}")))?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            acl_token: non_empty_env("CONSUL_HTTP_TOKEN"),
            dc: non_empty_env("CONSUL_DC"),
            host: std::env::var("CONSUL_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port,
        })
    }

    pub fn with_acl_token(mut self, token: impl Into<String>) -> Self {
        self.acl_token = Some(token.into());
        self
    }

    pub fn with_dc(mut self, dc: impl Into<String>) -> Self {
        self.dc = Some(dc.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConsulError> {
        if self.host.trim().is_empty() {
            return Err(ConsulError::InvalidConfig("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConsulError::InvalidConfig("port must not be zero".to_string()));
        }
        Ok(())
    }

    /// `http://host:port`; IPv6 literals are bracketed.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains(':') && !host.starts_with('[') {
            format!("http://[{host}]:{}", self.port)
        } else {
            format!("http://{host}:{}", self.port)
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
