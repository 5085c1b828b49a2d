//! Re-exposes the [`client_sdk::ConsulClient`] operation set over a message bus.
//!
//! A [`ConsulService`] owns the client and serves JSON requests; a
//! [`ServiceProxy`] is the cloneable handle remote callers use. Both sides are
//! generated from the single operation table in [`operations`].

mod operations;
mod proxy;
mod service;

pub use operations::ConsulRequest;
pub use proxy::{BusMessage, BusReceiver, BusSender, ServiceProxy, channel};
pub use service::ConsulService;
