//! JSON envelopes of the agent's v1 HTTP API.
//!
//! Field names follow the agent's PascalCase schema. Conversions into the
//! domain types live next to each envelope.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    AclToken, AclTokenType, CheckInfo, CheckOptions, CheckStatus, Event, KeyValuePair,
    ServiceInfo, ServiceOptions,
};

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(encoded: &str) -> Result<String, base64::DecodeError> {
    let bytes = STANDARD.decode(encoded)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads an explicit `null` as the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct KvEntry {
    pub lock_index: u64,
    pub key: String,
    pub flags: u64,
    pub value: Option<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl TryFrom<KvEntry> for KeyValuePair {
    type Error = base64::DecodeError;

    fn try_from(entry: KvEntry) -> Result<Self, Self::Error> {
        let value = match entry.value.as_deref() {
            Some(encoded) => decode_payload(encoded)?,
            None => String::new(),
        };
        Ok(KeyValuePair {
            key: entry.key,
            value,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventEntry {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub payload: Option<String>,
    pub node_filter: String,
    pub service_filter: String,
    pub tag_filter: String,
    pub version: u32,
    #[serde(rename = "LTime")]
    pub l_time: u64,
}

impl TryFrom<EventEntry> for Event {
    type Error = base64::DecodeError;

    fn try_from(entry: EventEntry) -> Result<Self, Self::Error> {
        let payload = match entry.payload.as_deref() {
            Some(encoded) => decode_payload(encoded)?,
            None => String::new(),
        };
        Ok(Event {
            id: entry.id,
            name: entry.name,
            payload,
            node_filter: entry.node_filter,
            service_filter: entry.service_filter,
            tag_filter: entry.tag_filter,
            version: entry.version,
            l_time: entry.l_time,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct CheckRegistration {
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "ServiceID", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CheckStatus>,
}

impl From<&CheckOptions> for CheckRegistration {
    fn from(options: &CheckOptions) -> Self {
        Self {
            id: options.id.clone(),
            name: options.name.clone(),
            service_id: options.service_id.clone(),
            notes: options.notes.clone(),
            ttl: options.ttl.clone(),
            http: options.http.clone(),
            script: options.script.clone(),
            interval: options.interval.clone(),
            status: options.status,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceRegistration {
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckRegistration>,
}

impl From<&ServiceOptions> for ServiceRegistration {
    fn from(options: &ServiceOptions) -> Self {
        Self {
            id: options.id.clone(),
            name: options.name.clone(),
            tags: options.tags.clone(),
            address: options.address.clone(),
            port: options.port,
            check: options.check_options.as_ref().map(CheckRegistration::from),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
}

impl From<AgentService> for ServiceInfo {
    fn from(service: AgentService) -> Self {
        ServiceInfo {
            id: service.id,
            name: service.service,
            tags: service.tags,
            address: service.address,
            port: service.port,
            ..ServiceInfo::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogService {
    pub node: String,
    pub address: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub service_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub service_tags: Vec<String>,
    pub service_address: String,
    pub service_port: u16,
}

impl From<CatalogService> for ServiceInfo {
    fn from(service: CatalogService) -> Self {
        ServiceInfo {
            id: service.service_id,
            name: service.service_name,
            node: service.node,
            node_address: service.address,
            tags: service.service_tags,
            address: service.service_address,
            port: service.service_port,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentCheck {
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    pub status: CheckStatus,
    pub notes: String,
    pub output: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub service_name: String,
}

impl From<AgentCheck> for CheckInfo {
    fn from(check: AgentCheck) -> Self {
        CheckInfo {
            id: check.check_id,
            name: check.name,
            node: check.node,
            service_id: check.service_id,
            service_name: check.service_name,
            status: check.status,
            notes: check.notes,
            output: check.output,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct CheckUpdate {
    pub status: CheckStatus,
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AclEntry {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub token_type: AclTokenType,
    pub rules: String,
    pub create_index: u64,
    pub modify_index: u64,
}

impl From<AclEntry> for AclToken {
    fn from(entry: AclEntry) -> Self {
        AclToken {
            id: entry.id,
            name: entry.name,
            token_type: entry.token_type,
            rules: entry.rules,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AclCreate {
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "Type")]
    pub token_type: AclTokenType,
    pub rules: String,
}

impl From<&AclToken> for AclCreate {
    fn from(token: &AclToken) -> Self {
        Self {
            id: (!token.id.is_empty()).then(|| token.id.clone()),
            name: token.name.clone(),
            token_type: token.token_type,
            rules: token.rules.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclCreated {
    #[serde(rename = "ID")]
    pub id: String,
}
