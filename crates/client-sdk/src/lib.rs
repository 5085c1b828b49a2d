use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::wire::{
    AclCreate, AclCreated, AclEntry, AgentCheck, AgentService, CatalogService, CheckRegistration,
    CheckUpdate, EventEntry, KvEntry, ServiceRegistration,
};
use common::{AclToken, CheckInfo, CheckOptions, Event, KeyValuePair, ServiceInfo, ServiceOptions};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

mod config;
mod error;

pub use config::ClientConfig;
pub use error::ConsulError;

pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Asynchronous client for a single agent.
///
/// Every operation issues exactly one HTTP request and resolves exactly once.
/// Clones share the underlying connection pool; [`ConsulClient::close`] on any
/// clone releases it for all of them.
#[derive(Clone)]
pub struct ConsulClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: Mutex<Option<Client>>,
    base_url: Url,
    config: ClientConfig,
}

impl ConsulClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConsulError> {
        config.validate()?;
        let base_url = Url::parse(&config.base_url()).map_err(|err| {
            ConsulError::InvalidConfig(format!("invalid agent address {}: {err}", config.base_url()))
        })?;
        let http = Client::builder()
            .build()
            .map_err(|err| ConsulError::Transport(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http: Mutex::new(Some(http)),
                base_url,
                config,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .http
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Releases the transport. Later calls to any operation fail with
    /// [`ConsulError::Closed`]; closing again has no effect.
    pub fn close(&self) {
        let released = self
            .inner
            .http
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            info!(base_url = %self.inner.base_url, "consul client closed");
        }
    }

    pub async fn put_value(&self, key: &str, value: &str) -> Result<(), ConsulError> {
        let key = require_key(key)?;
        let request = self
            .request(Method::PUT, "v1/kv", &key_segments(key))?
            .body(value.to_string());
        let applied: bool = self.send_json(request).await?;
        if !applied {
            return Err(ConsulError::Rejected {
                status: StatusCode::OK.as_u16(),
                message: format!("write to key {key} was not applied"),
            });
        }
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<KeyValuePair, ConsulError> {
        let key = require_key(key)?;
        let request = self.request(Method::GET, "v1/kv", &key_segments(key))?;
        let entries: Vec<KvEntry> = self.send_json(request).await?;
        let entry = entries
            .into_iter()
            .find(|entry| entry.key == key)
            .ok_or_else(|| ConsulError::NotFound(format!("key {key}")))?;
        decode_kv(entry)
    }

    pub async fn get_values(&self, key_prefix: &str) -> Result<Vec<KeyValuePair>, ConsulError> {
        let prefix = key_prefix.trim_start_matches('/');
        let request = self
            .request(Method::GET, "v1/kv", &key_segments(prefix))?
            .query(&[("recurse", "")]);
        match self.send_json::<Vec<KvEntry>>(request).await {
            Ok(entries) => entries.into_iter().map(decode_kv).collect(),
            Err(ConsulError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_value(&self, key: &str) -> Result<(), ConsulError> {
        let key = require_key(key)?;
        let request = self.request(Method::DELETE, "v1/kv", &key_segments(key))?;
        self.send(request).await.map(drop)
    }

    pub async fn delete_values(&self, key_prefix: &str) -> Result<(), ConsulError> {
        let prefix = key_prefix.trim_start_matches('/');
        let request = self
            .request(Method::DELETE, "v1/kv", &key_segments(prefix))?
            .query(&[("recurse", "")]);
        self.send(request).await.map(drop)
    }

    pub async fn fire_event(&self, event: &Event) -> Result<Event, ConsulError> {
        if event.name.is_empty() {
            return Err(ConsulError::InvalidInput(
                "event name must not be empty".to_string(),
            ));
        }

        let mut request = self
            .request(Method::PUT, "v1/event/fire", &[event.name.as_str()])?
            .body(event.payload.clone());
        for (param, value) in [
            ("node", &event.node_filter),
            ("service", &event.service_filter),
            ("tag", &event.tag_filter),
        ] {
            if !value.is_empty() {
                request = request.query(&[(param, value)]);
            }
        }

        let entry: EventEntry = self.send_json(request).await?;
        Event::try_from(entry).map_err(|err| ConsulError::Decode(err.to_string()))
    }

    pub async fn list_events(&self) -> Result<Vec<Event>, ConsulError> {
        let request = self.request(Method::GET, "v1/event/list", &[])?;
        let entries: Vec<EventEntry> = self.send_json(request).await?;
        entries
            .into_iter()
            .map(|entry| Event::try_from(entry).map_err(|err| ConsulError::Decode(err.to_string())))
            .collect()
    }

    pub async fn register_service(&self, service: &ServiceOptions) -> Result<(), ConsulError> {
        if service.name.is_empty() {
            return Err(ConsulError::InvalidInput(
                "service name must not be empty".to_string(),
            ));
        }
        let request = self
            .request(Method::PUT, "v1/agent/service/register", &[])?
            .json(&ServiceRegistration::from(service));
        self.send(request).await.map(drop)
    }

    pub async fn deregister_service(&self, id: &str) -> Result<(), ConsulError> {
        let id = require_id(id, "service")?;
        let request = self.request(Method::PUT, "v1/agent/service/deregister", &[id])?;
        self.send(request).await.map(drop)
    }

    pub async fn local_services(&self) -> Result<Vec<ServiceInfo>, ConsulError> {
        let request = self.request(Method::GET, "v1/agent/services", &[])?;
        let services: BTreeMap<String, AgentService> = self.send_json(request).await?;
        Ok(services.into_values().map(ServiceInfo::from).collect())
    }

    pub async fn info_service(&self, name: &str) -> Result<Vec<ServiceInfo>, ConsulError> {
        let name = require_id(name, "service")?;
        let request = self.request(Method::GET, "v1/catalog/service", &[name])?;
        let services: Vec<CatalogService> = self.send_json(request).await?;
        Ok(services.into_iter().map(ServiceInfo::from).collect())
    }

    pub async fn register_check(&self, check: &CheckOptions) -> Result<(), ConsulError> {
        let request = self
            .request(Method::PUT, "v1/agent/check/register", &[])?
            .json(&CheckRegistration::from(check));
        self.send(request).await.map(drop)
    }

    pub async fn deregister_check(&self, id: &str) -> Result<(), ConsulError> {
        let id = require_id(id, "check")?;
        let request = self.request(Method::PUT, "v1/agent/check/deregister", &[id])?;
        self.send(request).await.map(drop)
    }

    pub async fn pass_check(&self, id: &str) -> Result<(), ConsulError> {
        self.ttl_transition("pass", id, None).await
    }

    pub async fn pass_check_with_note(&self, id: &str, note: &str) -> Result<(), ConsulError> {
        self.ttl_transition("pass", id, Some(note)).await
    }

    pub async fn warn_check(&self, id: &str) -> Result<(), ConsulError> {
        self.ttl_transition("warn", id, None).await
    }

    pub async fn warn_check_with_note(&self, id: &str, note: &str) -> Result<(), ConsulError> {
        self.ttl_transition("warn", id, Some(note)).await
    }

    pub async fn fail_check(&self, id: &str) -> Result<(), ConsulError> {
        self.ttl_transition("fail", id, None).await
    }

    pub async fn fail_check_with_note(&self, id: &str, note: &str) -> Result<(), ConsulError> {
        self.ttl_transition("fail", id, Some(note)).await
    }

    pub async fn update_check(&self, check: &CheckInfo) -> Result<(), ConsulError> {
        let id = require_id(&check.id, "check")?;
        let request = self
            .request(Method::PUT, "v1/agent/check/update", &[id])?
            .json(&CheckUpdate {
                status: check.status,
                output: check.output.clone(),
            });
        self.send(request).await.map(drop)
    }

    pub async fn local_checks(&self) -> Result<Vec<CheckInfo>, ConsulError> {
        let request = self.request(Method::GET, "v1/agent/checks", &[])?;
        let checks: BTreeMap<String, AgentCheck> = self.send_json(request).await?;
        Ok(checks.into_values().map(CheckInfo::from).collect())
    }

    pub async fn create_acl_token(&self, token: &AclToken) -> Result<String, ConsulError> {
        let request = self
            .request(Method::PUT, "v1/acl/create", &[])?
            .json(&AclCreate::from(token));
        let created: AclCreated = self.send_json(request).await?;
        if created.id.is_empty() {
            return Err(ConsulError::Decode(
                "store returned an empty token id".to_string(),
            ));
        }
        Ok(created.id)
    }

    pub async fn info_acl_token(&self, id: &str) -> Result<AclToken, ConsulError> {
        let id = require_id(id, "token")?;
        let request = self.request(Method::GET, "v1/acl/info", &[id])?;
        let entries: Option<Vec<AclEntry>> = self.send_json(request).await?;
        entries
            .unwrap_or_default()
            .into_iter()
            .find(|entry| entry.id == id)
            .map(AclToken::from)
            .ok_or_else(|| ConsulError::NotFound(format!("acl token {id}")))
    }

    pub async fn list_acl_tokens(&self) -> Result<Vec<AclToken>, ConsulError> {
        let request = self.request(Method::GET, "v1/acl/list", &[])?;
        let entries: Vec<AclEntry> = self.send_json(request).await?;
        Ok(entries.into_iter().map(AclToken::from).collect())
    }

    pub async fn destroy_acl_token(&self, id: &str) -> Result<(), ConsulError> {
        let id = require_id(id, "token")?;
        let request = self.request(Method::PUT, "v1/acl/destroy", &[id])?;
        self.send(request).await.map(drop)
    }

    async fn ttl_transition(
        &self,
        transition: &str,
        id: &str,
        note: Option<&str>,
    ) -> Result<(), ConsulError> {
        let id = require_id(id, "check")?;
        let route = format!("v1/agent/check/{transition}");
        let mut request = self.request(Method::PUT, &route, &[id])?;
        if let Some(note) = note {
            request = request.query(&[("note", note)]);
        }
        self.send(request).await.map(drop)
    }

    fn transport(&self) -> Result<Client, ConsulError> {
        self.inner
            .http
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConsulError::Closed)
    }

    /// Builds a request for `route` followed by `tail`, each tail segment
    /// percent-encoded on its own.
    fn request(
        &self,
        method: Method,
        route: &str,
        tail: &[&str],
    ) -> Result<RequestBuilder, ConsulError> {
        let http = self.transport()?;
        let url = self.endpoint(route, tail)?;
        debug!(%method, path = url.path(), "consul request");

        let mut request = http.request(method, url);
        if let Some(dc) = &self.inner.config.dc {
            request = request.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.inner.config.acl_token {
            request = request.header(TOKEN_HEADER, token);
        }
        Ok(request)
    }

    fn endpoint(&self, route: &str, tail: &[&str]) -> Result<Url, ConsulError> {
        let mut url = self.inner.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ConsulError::InvalidConfig(format!("{} cannot carry a path", self.inner.base_url))
            })?
            .pop_if_empty()
            .extend(route.split('/'))
            .extend(tail);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ConsulError> {
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().path().to_string();
        let message = match response.text().await {
            Ok(body) => body,
            Err(err) => format!("<unreadable body: {err}>"),
        };
        if status == StatusCode::NOT_FOUND {
            debug!(path = %url, "consul resource not found");
            let detail = if message.trim().is_empty() { url } else { message };
            return Err(ConsulError::NotFound(detail));
        }

        warn!(path = %url, status = status.as_u16(), error = %message, "consul rejected request");
        Err(ConsulError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ConsulError> {
        let body = self.send(request).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn require_key(key: &str) -> Result<&str, ConsulError> {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(ConsulError::InvalidInput("key must not be empty".to_string()));
    }
    Ok(key)
}

/// Splits a key into path segments; `/` stays a separator, everything
/// else is encoded.
fn key_segments(key: &str) -> Vec<&str> {
    key.split('/').collect()
}

fn require_id<'a>(id: &'a str, what: &str) -> Result<&'a str, ConsulError> {
    if id.trim().is_empty() {
        return Err(ConsulError::InvalidInput(format!("{what} id must not be empty")));
    }
    Ok(id)
}

fn decode_kv(entry: KvEntry) -> Result<KeyValuePair, ConsulError> {
    KeyValuePair::try_from(entry).map_err(|err| ConsulError::Decode(err.to_string()))
}
