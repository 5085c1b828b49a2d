use std::collections::{BTreeMap, VecDeque};

use common::wire::{
    AclCreate, AclEntry, AgentCheck, AgentService, CatalogService, CheckRegistration, EventEntry,
    KvEntry, ServiceRegistration, encode_payload,
};
use common::{AclTokenType, CheckStatus};
use thiserror::Error;
use uuid::Uuid;

/// Recent user events kept for `/v1/event/list`.
pub const EVENT_BUFFER_SIZE: usize = 256;

const AGENT_SERVER_PORT: u16 = 8300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
struct CheckRecord {
    check: AgentCheck,
    ttl: bool,
}

/// In-memory agent state: key/value, events, local services and checks, ACL tokens.
///
/// Every write bumps a single raft-style index so KV entries carry
/// monotonically increasing create/modify indexes.
pub struct AgentStore {
    node_name: String,
    node_address: String,
    index: u64,
    event_clock: u64,
    kv: BTreeMap<String, KvEntry>,
    events: VecDeque<EventEntry>,
    services: BTreeMap<String, AgentService>,
    checks: BTreeMap<String, CheckRecord>,
    tokens: BTreeMap<String, AclEntry>,
}

impl AgentStore {
    pub fn new(node_name: impl Into<String>, node_address: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            node_address: node_address.into(),
            index: 0,
            event_clock: 0,
            kv: BTreeMap::new(),
            events: VecDeque::new(),
            services: BTreeMap::new(),
            checks: BTreeMap::new(),
            tokens: BTreeMap::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    pub fn kv_put(&mut self, key: &str, value: &[u8]) {
        let index = self.next_index();
        let encoded = encode_payload(value);
        self.kv
            .entry(key.to_string())
            .and_modify(|entry| {
                entry.value = Some(encoded.clone());
                entry.modify_index = index;
            })
            .or_insert_with(|| KvEntry {
                key: key.to_string(),
                value: Some(encoded),
                create_index: index,
                modify_index: index,
                ..KvEntry::default()
            });
    }

    pub fn kv_get(&self, key: &str) -> Option<KvEntry> {
        self.kv.get(key).cloned()
    }

    pub fn kv_list(&self, prefix: &str) -> Vec<KvEntry> {
        self.kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn kv_delete(&mut self, key: &str) {
        if self.kv.remove(key).is_some() {
            self.next_index();
        }
    }

    pub fn kv_delete_prefix(&mut self, prefix: &str) -> usize {
        let before = self.kv.len();
        self.kv.retain(|key, _| !key.starts_with(prefix));
        let removed = before - self.kv.len();
        if removed > 0 {
            self.next_index();
        }
        removed
    }

    pub fn fire_event(
        &mut self,
        name: &str,
        payload: &[u8],
        node_filter: &str,
        service_filter: &str,
        tag_filter: &str,
    ) -> EventEntry {
        self.event_clock += 1;
        let event = EventEntry {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            payload: (!payload.is_empty()).then(|| encode_payload(payload)),
            node_filter: node_filter.to_string(),
            service_filter: service_filter.to_string(),
            tag_filter: tag_filter.to_string(),
            version: 1,
            l_time: self.event_clock,
        };

        self.events.push_back(event.clone());
        while self.events.len() > EVENT_BUFFER_SIZE {
            self.events.pop_front();
        }
        event
    }

    pub fn list_events(&self, name: Option<&str>) -> Vec<EventEntry> {
        self.events
            .iter()
            .filter(|event| name.is_none_or(|name| event.name == name))
            .cloned()
            .collect()
    }

    pub fn register_service(&mut self, registration: ServiceRegistration) -> Result<(), StoreError> {
        if registration.name.trim().is_empty() {
            return Err(StoreError::Invalid("Missing service name".to_string()));
        }

        let service_id = registration
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| registration.name.clone());

        let bound_check = match &registration.check {
            Some(check) => {
                validate_check_definition(check)?;
                Some(CheckRecord {
                    ttl: check.ttl.is_some(),
                    check: AgentCheck {
                        node: self.node_name.clone(),
                        check_id: format!("service:{service_id}"),
                        name: format!("Service '{}' check", registration.name),
                        status: check.status.unwrap_or(CheckStatus::Critical),
                        notes: check.notes.clone().unwrap_or_default(),
                        output: String::new(),
                        service_id: service_id.clone(),
                        service_name: registration.name.clone(),
                    },
                })
            }
            None => None,
        };

        self.next_index();
        self.services.insert(
            service_id.clone(),
            AgentService {
                id: service_id,
                service: registration.name,
                tags: registration.tags,
                address: registration.address.unwrap_or_default(),
                port: registration.port.unwrap_or_default(),
            },
        );
        if let Some(record) = bound_check {
            self.checks.insert(record.check.check_id.clone(), record);
        }
        Ok(())
    }

    pub fn deregister_service(&mut self, id: &str) -> Result<(), StoreError> {
        if self.services.remove(id).is_none() {
            return Err(StoreError::NotFound(format!("Unknown service ID {id:?}")));
        }
        self.checks.retain(|_, record| record.check.service_id != id);
        self.next_index();
        Ok(())
    }

    pub fn local_services(&self) -> BTreeMap<String, AgentService> {
        self.services.clone()
    }

    /// Catalog view of a service name. The agent's own `consul` service is
    /// always present.
    pub fn catalog_service(&self, name: &str) -> Vec<CatalogService> {
        let mut entries: Vec<CatalogService> = self
            .services
            .values()
            .filter(|service| service.service == name)
            .map(|service| CatalogService {
                node: self.node_name.clone(),
                address: self.node_address.clone(),
                service_id: service.id.clone(),
                service_name: service.service.clone(),
                service_tags: service.tags.clone(),
                service_address: service.address.clone(),
                service_port: service.port,
            })
            .collect();

        if name == "consul" {
            entries.push(CatalogService {
                node: self.node_name.clone(),
                address: self.node_address.clone(),
                service_id: "consul".to_string(),
                service_name: "consul".to_string(),
                service_tags: Vec::new(),
                service_address: String::new(),
                service_port: AGENT_SERVER_PORT,
            });
        }
        entries
    }

    pub fn register_check(&mut self, registration: CheckRegistration) -> Result<(), StoreError> {
        let name = registration
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| StoreError::Invalid("Missing check name".to_string()))?;
        validate_check_definition(&registration)?;

        let service_id = registration.service_id.clone().unwrap_or_default();
        let service_name = if service_id.is_empty() {
            String::new()
        } else {
            self.services
                .get(&service_id)
                .map(|service| service.service.clone())
                .ok_or_else(|| {
                    StoreError::Invalid(format!("ServiceID {service_id:?} does not exist"))
                })?
        };

        let check_id = registration
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| name.clone());

        self.next_index();
        self.checks.insert(
            check_id.clone(),
            CheckRecord {
                ttl: registration.ttl.is_some(),
                check: AgentCheck {
                    node: self.node_name.clone(),
                    check_id,
                    name,
                    status: registration.status.unwrap_or(CheckStatus::Critical),
                    notes: registration.notes.unwrap_or_default(),
                    output: String::new(),
                    service_id,
                    service_name,
                },
            },
        );
        Ok(())
    }

    pub fn deregister_check(&mut self, id: &str) -> Result<(), StoreError> {
        if self.checks.remove(id).is_none() {
            return Err(unknown_check(id));
        }
        self.next_index();
        Ok(())
    }

    /// Applies a TTL heartbeat. Only TTL checks accept one.
    pub fn update_ttl_check(
        &mut self,
        id: &str,
        status: CheckStatus,
        output: &str,
    ) -> Result<(), StoreError> {
        let record = self.checks.get_mut(id).ok_or_else(|| unknown_check(id))?;
        if !record.ttl {
            return Err(StoreError::Invalid(format!(
                "CheckID {id:?} does not have associated TTL"
            )));
        }
        record.check.status = status;
        record.check.output = output.to_string();
        Ok(())
    }

    pub fn local_checks(&self) -> BTreeMap<String, AgentCheck> {
        self.checks
            .iter()
            .map(|(id, record)| (id.clone(), record.check.clone()))
            .collect()
    }

    pub fn acl_create(&mut self, request: AclCreate) -> Result<String, StoreError> {
        let id = match request.id.filter(|id| !id.is_empty()) {
            Some(id) if self.tokens.contains_key(&id) => {
                return Err(StoreError::Invalid(format!("ACL {id:?} already exists")));
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let index = self.next_index();
        self.tokens.insert(
            id.clone(),
            AclEntry {
                id: id.clone(),
                name: request.name,
                token_type: request.token_type,
                rules: request.rules,
                create_index: index,
                modify_index: index,
            },
        );
        Ok(id)
    }

    pub fn acl_info(&self, id: &str) -> Option<AclEntry> {
        self.tokens.get(id).cloned()
    }

    pub fn acl_list(&self) -> Vec<AclEntry> {
        self.tokens.values().cloned().collect()
    }

    pub fn acl_destroy(&mut self, id: &str) -> Result<(), StoreError> {
        if self.tokens.remove(id).is_none() {
            return Err(StoreError::NotFound(format!("Unknown ACL {id:?}")));
        }
        self.next_index();
        Ok(())
    }

    pub fn token_type(&self, id: &str) -> Option<AclTokenType> {
        self.tokens.get(id).map(|entry| entry.token_type)
    }
}

fn validate_check_definition(check: &CheckRegistration) -> Result<(), StoreError> {
    let has_ttl = check.ttl.as_deref().is_some_and(|ttl| !ttl.is_empty());
    let has_interval = check.interval.as_deref().is_some_and(|i| !i.is_empty());
    let has_probe = check.http.is_some() || check.script.is_some();

    if has_ttl || (has_probe && has_interval) {
        Ok(())
    } else {
        Err(StoreError::Invalid(
            "Must provide TTL or Script/HTTP and Interval".to_string(),
        ))
    }
}

fn unknown_check(id: &str) -> StoreError {
    StoreError::NotFound(format!("Unknown check ID {id:?}"))
}
