//! Devices, properties and elements mirrored from an INDI server

use serde::Serialize;
use std::fmt;

use crate::message::Message;
use crate::protocol::{Permission, PropertyKind, PropertyState, SwitchRule, SwitchState};

/// Numeric element value with its limits
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberValue {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// printf-style format announced by the driver (e.g. `%010.6m`)
    pub format: String,
    /// Value last requested by this client
    pub target: f64,
}

impl NumberValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            min: 0.0,
            max: 0.0,
            step: 0.0,
            format: "%g".to_string(),
            target: value,
        }
    }
}

/// Binary element value
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BlobValue {
    /// Size declared by the sender
    pub size: usize,
    /// File suffix such as `.fits` or `.fits.z`
    pub format: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementValue {
    Text(String),
    Number(NumberValue),
    Switch(SwitchState),
    Light(PropertyState),
    Blob(BlobValue),
}

impl ElementValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Text(_) => PropertyKind::Text,
            Self::Number(_) => PropertyKind::Number,
            Self::Switch(_) => PropertyKind::Switch,
            Self::Light(_) => PropertyKind::Light,
            Self::Blob(_) => PropertyKind::Blob,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(number.value),
            _ => None,
        }
    }

    pub fn as_switch(&self) -> Option<SwitchState> {
        match self {
            Self::Switch(state) => Some(*state),
            _ => None,
        }
    }

    pub fn as_light(&self) -> Option<PropertyState> {
        match self {
            Self::Light(state) => Some(*state),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobValue> {
        match self {
            Self::Blob(blob) => Some(blob),
            _ => None,
        }
    }
}

/// A single named value within a property
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Element {
    pub name: String,
    pub label: String,
    pub value: ElementValue,
}

impl Element {
    pub fn new(name: impl Into<String>, value: ElementValue) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            value,
        }
    }
}

/// A typed vector of elements owned by a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub name: String,
    pub label: String,
    /// GUI grouping announced by the driver
    pub group: String,
    kind: PropertyKind,
    pub state: PropertyState,
    /// Absent for lights
    pub permission: Option<Permission>,
    /// Switch rule, switches only
    pub rule: Option<SwitchRule>,
    /// Worst-case seconds the driver needs to apply a change
    pub timeout: f64,
    pub timestamp: Option<String>,
    elements: Vec<Element>,
}

impl Property {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            group: String::new(),
            kind,
            state: PropertyState::Idle,
            permission: None,
            rule: None,
            timeout: 0.0,
            timestamp: None,
            elements: Vec::new(),
        }
    }

    /// Kind is fixed at definition
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn element_index(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }

    /// Append an element while the property is being defined.
    ///
    /// Returns the element back if its name is taken or its value does not
    /// match the property kind.
    pub fn push_element(&mut self, element: Element) -> Result<(), Element> {
        if element.value.kind() != self.kind || self.element(&element.name).is_some() {
            return Err(element);
        }
        self.elements.push(element);
        Ok(())
    }

    /// Replace the value of an existing element, keeping its identity.
    ///
    /// Returns the value back if the index is out of range or the value has
    /// another kind.
    pub fn update_value(&mut self, index: usize, value: ElementValue) -> Result<(), ElementValue> {
        if value.kind() != self.kind {
            return Err(value);
        }
        match self.elements.get_mut(index) {
            Some(element) => {
                element.value = value;
                Ok(())
            }
            None => Err(value),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.permission.map_or(false, Permission::is_writable)
    }
}

/// A remote instrument grouping properties
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub name: String,
    /// Grouping label chosen by the client, defaults to the device name
    pub label: String,
    properties: Vec<Property>,
    messages: Vec<Message>,
}

impl Device {
    pub fn new(name: impl Into<String>, label: Option<&str>) -> Self {
        let name = name.into();
        Self {
            label: label.map_or_else(|| name.clone(), str::to_string),
            name,
            properties: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Properties in definition order
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    /// Add a property; returns it back if the name is already defined
    pub fn insert_property(&mut self, property: Property) -> Result<(), Property> {
        if self.property(&property.name).is_some() {
            return Err(property);
        }
        self.properties.push(property);
        Ok(())
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Property> {
        let index = self.properties.iter().position(|p| p.name == name)?;
        Some(self.properties.remove(index))
    }

    /// Message log, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} properties)", self.name, self.properties.len())
    }
}
