//! Registry of devices known on one server connection
//!
//! The registry owns every [`Device`], which owns its properties, which own
//! their elements. Changes are announced on a broadcast channel so that
//! collaborators (a UI, a logger) can follow them without holding
//! references into the registry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::device::{Device, Property};
use crate::message::Message;
use crate::protocol::PropertyKind;

/// Capacity of the event channel; slow receivers see `Lagged`
pub const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no such device {0}")]
    MissingDevice(String),
    #[error("device {device} has no property {property}")]
    MissingProperty { device: String, property: String },
    #[error("property {device}.{property} is already defined")]
    DuplicateProperty { device: String, property: String },
}

/// Which devices `remove_device` deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector<'a> {
    /// Every device
    All,
    /// The device with exactly this name; an empty name is a name like any other
    Named(&'a str),
}

/// Change notification for registry observers
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    DeviceCreated { device: String },
    DeviceRemoved { device: String },
    PropertyDefined { device: String, property: String, kind: PropertyKind },
    PropertyUpdated { device: String, property: String },
    PropertyRemoved { device: String, property: String },
    /// A driver message, attached to a device log or not
    Message(Message),
    /// Malformed markup or a rejected command
    ProtocolError(String),
    /// The connection was torn down
    Disconnected { cause: String },
}

/// Device registry for one connection
#[derive(Debug)]
pub struct Registry {
    devices: HashMap<String, Device>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            devices: HashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: RegistryEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All devices, in no particular order
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices sorted by name, for stable output
    pub fn snapshot(&self) -> Vec<&Device> {
        let mut devices: Vec<&Device> = self.devices.values().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn find_device(&self, name: &str) -> Result<&Device, RegistryError> {
        self.devices
            .get(name)
            .ok_or_else(|| RegistryError::MissingDevice(name.to_string()))
    }

    pub fn find_device_mut(&mut self, name: &str) -> Result<&mut Device, RegistryError> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| RegistryError::MissingDevice(name.to_string()))
    }

    /// Look a device up, creating it with `label` (or its name) when absent
    pub fn find_or_create_device(&mut self, name: &str, label: Option<&str>) -> &mut Device {
        match self.devices.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                info!(device = name, label = label.unwrap_or(name), "New device");
                let _ = self.event_tx.send(RegistryEvent::DeviceCreated {
                    device: name.to_string(),
                });
                entry.insert(Device::new(name, label))
            }
        }
    }

    /// Remove one device, or all of them
    pub fn remove_device(&mut self, selector: DeviceSelector<'_>) -> Result<(), RegistryError> {
        match selector {
            DeviceSelector::All => {
                let mut names: Vec<String> = self.devices.drain().map(|(name, _)| name).collect();
                names.sort();
                for device in names {
                    debug!(device = %device, "Device removed");
                    self.emit(RegistryEvent::DeviceRemoved { device });
                }
                Ok(())
            }
            DeviceSelector::Named(name) => {
                self.devices
                    .remove(name)
                    .ok_or_else(|| RegistryError::MissingDevice(name.to_string()))?;
                info!(device = name, "Device removed");
                self.emit(RegistryEvent::DeviceRemoved {
                    device: name.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Add a newly defined property, creating its device if needed
    pub fn define_property(
        &mut self,
        device: &str,
        label: Option<&str>,
        property: Property,
    ) -> Result<(), RegistryError> {
        let name = property.name.clone();
        let kind = property.kind();
        self.find_or_create_device(device, label)
            .insert_property(property)
            .map_err(|p| RegistryError::DuplicateProperty {
                device: device.to_string(),
                property: p.name,
            })?;
        debug!(device = device, property = %name, kind = %kind, "Property defined");
        self.emit(RegistryEvent::PropertyDefined {
            device: device.to_string(),
            property: name,
            kind,
        });
        Ok(())
    }

    pub fn find_property(&self, device: &str, property: &str) -> Result<&Property, RegistryError> {
        self.find_device(device)?
            .property(property)
            .ok_or_else(|| RegistryError::MissingProperty {
                device: device.to_string(),
                property: property.to_string(),
            })
    }

    pub fn find_property_mut(
        &mut self,
        device: &str,
        property: &str,
    ) -> Result<&mut Property, RegistryError> {
        self.find_device_mut(device)?
            .property_mut(property)
            .ok_or_else(|| RegistryError::MissingProperty {
                device: device.to_string(),
                property: property.to_string(),
            })
    }

    /// Delete one property; the device stays even when it has none left
    pub fn remove_property(&mut self, device: &str, property: &str) -> Result<Property, RegistryError> {
        let removed = self
            .find_device_mut(device)?
            .remove_property(property)
            .ok_or_else(|| RegistryError::MissingProperty {
                device: device.to_string(),
                property: property.to_string(),
            })?;
        debug!(device = device, property = property, "Property removed");
        self.emit(RegistryEvent::PropertyRemoved {
            device: device.to_string(),
            property: property.to_string(),
        });
        Ok(removed)
    }

    /// Announce an update made through `find_property_mut`
    pub fn property_updated(&self, device: &str, property: &str) {
        self.emit(RegistryEvent::PropertyUpdated {
            device: device.to_string(),
            property: property.to_string(),
        });
    }

    /// Log a message on its device if that device is known, and always
    /// publish it. Returns whether it was attached to a device.
    pub fn log_message(&mut self, message: Message) -> bool {
        let attached = match message
            .device
            .as_deref()
            .and_then(|name| self.devices.get_mut(name))
        {
            Some(device) => {
                device.push_message(message.clone());
                true
            }
            None => false,
        };
        debug!(device = ?message.device, attached, text = %message.text, "Message");
        self.emit(RegistryEvent::Message(message));
        attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Element, ElementValue};
    use tokio::sync::broadcast::error::TryRecvError;

    fn text_property(name: &str) -> Property {
        let mut property = Property::new(name, PropertyKind::Text);
        property
            .push_element(Element::new("VALUE", ElementValue::Text(String::new())))
            .unwrap();
        property
    }

    fn drain(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => return events,
                Err(e) => panic!("unexpected receive error: {e}"),
            }
        }
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let mut registry = Registry::new();
        let mut rx = registry.subscribe();

        registry.find_or_create_device("CCD", Some("Imaging"));
        registry.find_or_create_device("CCD", Some("Other"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_device("CCD").unwrap().label, "Imaging");
        assert_eq!(
            drain(&mut rx),
            vec![RegistryEvent::DeviceCreated {
                device: "CCD".to_string()
            }]
        );
    }

    #[test]
    fn test_find_device_never_creates() {
        let registry = Registry::new();
        assert_eq!(
            registry.find_device("Focuser").unwrap_err(),
            RegistryError::MissingDevice("Focuser".to_string())
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_define_rejects_duplicate_property() {
        let mut registry = Registry::new();
        registry.define_property("CCD", None, text_property("INFO")).unwrap();
        let err = registry
            .define_property("CCD", None, text_property("INFO"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProperty { .. }));
        assert_eq!(registry.find_device("CCD").unwrap().properties().len(), 1);
    }

    #[test]
    fn test_remove_property_keeps_device() {
        let mut registry = Registry::new();
        registry.define_property("CCD", None, text_property("INFO")).unwrap();

        registry.remove_property("CCD", "INFO").unwrap();
        let device = registry.find_device("CCD").unwrap();
        assert!(device.properties().is_empty());

        assert!(matches!(
            registry.remove_property("CCD", "INFO"),
            Err(RegistryError::MissingProperty { .. })
        ));
        assert!(matches!(
            registry.remove_property("Mount", "INFO"),
            Err(RegistryError::MissingDevice(_))
        ));
    }

    #[test]
    fn test_remove_named_and_all() {
        let mut registry = Registry::new();
        registry.find_or_create_device("A", None);
        registry.find_or_create_device("B", None);
        registry.find_or_create_device("", None);

        registry.remove_device(DeviceSelector::Named("")).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(matches!(
            registry.remove_device(DeviceSelector::Named("")),
            Err(RegistryError::MissingDevice(_))
        ));

        let mut rx = registry.subscribe();
        registry.remove_device(DeviceSelector::All).unwrap();
        assert!(registry.is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![
                RegistryEvent::DeviceRemoved { device: "A".to_string() },
                RegistryEvent::DeviceRemoved { device: "B".to_string() },
            ]
        );
        // removing all from an empty registry is fine
        registry.remove_device(DeviceSelector::All).unwrap();
    }

    #[test]
    fn test_messages_without_device_are_published() {
        let mut registry = Registry::new();
        let mut rx = registry.subscribe();
        registry.find_or_create_device("CCD", None);
        drain(&mut rx);

        assert!(registry.log_message(Message::received(Some("CCD"), "exposure done")));
        assert!(!registry.log_message(Message::received(Some("Ghost"), "orphan")));
        assert!(!registry.log_message(Message::received(None, "general")));

        assert_eq!(registry.find_device("CCD").unwrap().messages().len(), 1);
        let texts: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RegistryEvent::Message(m) => Some(m.text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["exposure done", "orphan", "general"]);
    }

    #[test]
    fn test_snapshot_json_skips_blob_bytes() {
        use crate::device::BlobValue;

        let mut registry = Registry::new();
        let mut property = Property::new("CCD1", PropertyKind::Blob);
        property
            .push_element(Element::new(
                "IMAGE",
                ElementValue::Blob(BlobValue {
                    size: 3,
                    format: ".fits".to_string(),
                    data: vec![1, 2, 3],
                }),
            ))
            .unwrap();
        registry.define_property("CCD", None, property).unwrap();

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        let blob = &json[0]["properties"][0]["elements"][0]["value"]["blob"];
        assert_eq!(blob["size"], 3);
        assert_eq!(blob["format"], ".fits");
        assert!(blob.get("data").is_none());
        assert_eq!(json[0]["properties"][0]["kind"], "blob");
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = Registry::new();
        registry.find_or_create_device("b", None);
        registry.find_or_create_device("a", None);
        let names: Vec<&str> = registry.snapshot().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
