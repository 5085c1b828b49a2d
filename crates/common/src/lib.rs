use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod wire;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A user event. `id` is empty until the agent has accepted the event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub payload: String,
    pub node_filter: String,
    pub service_filter: String,
    pub tag_filter: String,
    pub version: u32,
    pub l_time: u64,
}

impl Event {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_node_filter(mut self, filter: impl Into<String>) -> Self {
        self.node_filter = filter.into();
        self
    }

    pub fn with_service_filter(mut self, filter: impl Into<String>) -> Self {
        self.service_filter = filter.into();
        self
    }

    pub fn with_tag_filter(mut self, filter: impl Into<String>) -> Self {
        self.tag_filter = filter.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    #[default]
    Critical,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCheckStatus(pub String);

impl fmt::Display for UnknownCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown check status: {}", self.0)
    }
}

impl std::error::Error for UnknownCheckStatus {}

impl FromStr for CheckStatus {
    type Err = UnknownCheckStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "passing" => Ok(Self::Passing),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownCheckStatus(other.to_string())),
        }
    }
}

/// Health check definition submitted with a check or service registration.
///
/// Exactly one of `ttl`, `http` or `script` is expected; the agent rejects
/// definitions without any of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    pub service_id: Option<String>,
    pub notes: Option<String>,
    pub ttl: Option<String>,
    pub http: Option<String>,
    pub script: Option<String>,
    pub interval: Option<String>,
    pub status: Option<CheckStatus>,
}

impl CheckOptions {
    pub fn ttl(ttl: impl Into<String>) -> Self {
        Self {
            ttl: Some(ttl.into()),
            ..Self::default()
        }
    }

    pub fn http(url: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            http: Some(url.into()),
            interval: Some(interval.into()),
            ..Self::default()
        }
    }

    pub fn script(script: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            interval: Some(interval.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_status(mut self, status: CheckStatus) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckInfo {
    pub id: String,
    pub name: String,
    pub node: String,
    pub service_id: String,
    pub service_name: String,
    pub status: CheckStatus,
    pub notes: String,
    pub output: String,
}

impl CheckInfo {
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_status(mut self, status: CheckStatus) -> Self {
        self.status = status;
        self
    }
}

/// Registration request for a service on the local agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOptions {
    pub id: Option<String>,
    pub name: String,
    pub tags: Vec<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub check_options: Option<CheckOptions>,
}

impl ServiceOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_check(mut self, check: CheckOptions) -> Self {
        self.check_options = Some(check);
        self
    }

    /// Identifier the agent files the service under: the explicit id, or the name.
    pub fn effective_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub node: String,
    pub node_address: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclTokenType {
    #[default]
    Client,
    Management,
}

impl AclTokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Management => "management",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AclToken {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub token_type: AclTokenType,
    pub rules: String,
}

impl AclToken {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, token_type: AclTokenType) -> Self {
        self.token_type = token_type;
        self
    }

    pub fn with_rules(mut self, rules: impl Into<String>) -> Self {
        self.rules = rules.into();
        self
    }
}
