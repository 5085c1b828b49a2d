use client_sdk::{ConsulClient, ConsulError};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::operations::dispatch_to_client;
use crate::proxy::{BusMessage, BusReceiver, ServiceProxy, channel};
use crate::ConsulRequest;

/// Service-side end of the bus: owns a [`ConsulClient`] and forwards every
/// request to it without reordering, retrying or rewriting results.
#[derive(Clone)]
pub struct ConsulService {
    client: ConsulClient,
}

impl ConsulService {
    pub fn new(client: ConsulClient) -> Self {
        Self { client }
    }

    /// Starts serving `client` on a fresh bus and returns the proxy for it.
    pub fn spawn(client: ConsulClient) -> ServiceProxy {
        let (proxy, receiver) = channel();
        tokio::spawn(Self::new(client).serve(receiver));
        proxy
    }

    pub async fn dispatch(&self, request: ConsulRequest) -> Result<Value, ConsulError> {
        let operation = request.operation();
        debug!(operation, "forwarding proxied call");
        dispatch_to_client(&self.client, request).await
    }

    /// Decodes a JSON request, dispatches it and encodes the reply.
    ///
    /// Entry point for any bus that delivers raw payloads.
    pub async fn handle_json(&self, payload: &str) -> String {
        let reply = match serde_json::from_str::<ConsulRequest>(payload) {
            Ok(request) => self.dispatch(request).await,
            Err(err) => {
                warn!(error = %err, "malformed proxied request");
                Err(ConsulError::InvalidInput(format!("malformed request: {err}")))
            }
        };
        encode_reply(&reply)
    }

    pub fn close(&self) {
        self.client.close();
    }

    /// Serves calls until every sender is dropped.
    ///
    /// Each call runs in its own task; a slow call never holds up the next.
    /// `Close` waits for the calls already received before closing the
    /// client, so only calls sent after it observe [`ConsulError::Closed`].
    pub async fn serve(self, mut receiver: BusReceiver) {
        let mut in_flight = JoinSet::new();
        while let Some(message) = receiver.recv().await {
            while in_flight.try_join_next().is_some() {}
            match message {
                BusMessage::Call { payload, reply } => {
                    let service = self.clone();
                    in_flight.spawn(async move {
                        let encoded = service.handle_json(&payload).await;
                        if reply.send(encoded).is_err() {
                            debug!("proxy caller went away before the reply");
                        }
                    });
                }
                BusMessage::Close => {
                    debug!(pending = in_flight.len(), "draining calls before close");
                    while in_flight.join_next().await.is_some() {}
                    self.close();
                }
            }
        }
        while in_flight.join_next().await.is_some() {}
        debug!("consul service bus closed");
    }
}

fn encode_reply(reply: &Result<Value, ConsulError>) -> String {
    serde_json::to_string(reply).unwrap_or_else(|err| {
        let fallback: Result<Value, ConsulError> = Err(ConsulError::Bus(err.to_string()));
        serde_json::to_string(&fallback).unwrap_or_default()
    })
}
