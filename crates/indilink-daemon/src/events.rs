//! Logging of registry and connection events

use indilink_core::RegistryEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Log one event at a level matching its importance
pub fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::DeviceCreated { device } => info!(device = %device, "Device appeared"),
        RegistryEvent::DeviceRemoved { device } => info!(device = %device, "Device removed"),
        RegistryEvent::PropertyDefined {
            device,
            property,
            kind,
        } => debug!(device = %device, property = %property, kind = %kind, "Property defined"),
        RegistryEvent::PropertyUpdated { device, property } => {
            debug!(device = %device, property = %property, "Property updated")
        }
        RegistryEvent::PropertyRemoved { device, property } => {
            info!(device = %device, property = %property, "Property removed")
        }
        RegistryEvent::Message(message) => info!(
            device = message.device.as_deref().unwrap_or("-"),
            timestamp = %message.timestamp,
            "{}",
            message.text
        ),
        RegistryEvent::ProtocolError(error) => warn!(error = %error, "Protocol error"),
        RegistryEvent::Disconnected { cause } => info!(cause = %cause, "Connection closed"),
    }
}

/// Log events from `rx` until the sender goes away
pub fn spawn_logger(mut rx: broadcast::Receiver<RegistryEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event channel lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
