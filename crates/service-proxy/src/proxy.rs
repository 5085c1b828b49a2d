use client_sdk::ConsulError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::ConsulRequest;

/// A message travelling from a [`ServiceProxy`] to a [`crate::ConsulService`].
///
/// Call payloads and replies are JSON text; nothing but strings crosses the bus.
#[derive(Debug)]
pub enum BusMessage {
    Call {
        payload: String,
        reply: oneshot::Sender<String>,
    },
    Close,
}

pub type BusSender = mpsc::UnboundedSender<BusMessage>;
pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

/// Creates a connected proxy and the receiving end a service serves from.
pub fn channel() -> (ServiceProxy, BusReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ServiceProxy::new(sender), receiver)
}

/// Remote handle to a [`crate::ConsulService`].
///
/// Exposes the same operations as [`client_sdk::ConsulClient`]; each one is
/// serialized into a [`ConsulRequest`], sent over the bus, and the reply is
/// decoded back into the client's result type. Errors raised by the client
/// arrive unchanged.
#[derive(Clone)]
pub struct ServiceProxy {
    bus: BusSender,
}

impl ServiceProxy {
    pub fn new(bus: BusSender) -> Self {
        Self { bus }
    }

    /// Sends one request and waits for its single reply.
    pub async fn call(&self, request: ConsulRequest) -> Result<Value, ConsulError> {
        let operation = request.operation();
        let payload = serde_json::to_string(&request)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.bus
            .send(BusMessage::Call {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| ConsulError::Bus(format!("consul service is not running ({operation})")))?;

        let reply = reply_rx
            .await
            .map_err(|_| ConsulError::Bus(format!("consul service dropped the call ({operation})")))?;

        serde_json::from_str::<Result<Value, ConsulError>>(&reply)?
    }

    /// Asks the service to close its client. Does not wait for the service.
    pub fn close(&self) {
        if self.bus.send(BusMessage::Close).is_err() {
            debug!("consul service already gone; close not delivered");
        }
    }
}
