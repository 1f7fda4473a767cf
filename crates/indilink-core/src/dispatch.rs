//! Routing of parsed INDI commands into registry mutations
//!
//! Every completed element goes through [`Dispatcher::dispatch`]. A failed
//! command is dropped and reported to the caller; it never affects the
//! connection and leaves the registry as it was.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::device::{BlobValue, Element, ElementValue, NumberValue, Property};
use crate::message::Message;
use crate::protocol::{parse_number, Command, PropertyKind, UnknownKeyword};
use crate::registry::{DeviceSelector, Registry, RegistryError};
use crate::xml::XmlElement;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("<{tag}> is missing required attribute '{attribute}'")]
    MissingAttribute { tag: String, attribute: &'static str },
    #[error("unknown command <{0}>")]
    UnknownTag(String),
    #[error("<{tag}> targets {device}.{property}, which is a {actual} property")]
    KindMismatch {
        tag: String,
        device: String,
        property: String,
        actual: PropertyKind,
    },
    #[error("invalid value in <{tag}> for '{name}': {reason}")]
    InvalidValue {
        tag: String,
        name: String,
        reason: String,
    },
}

impl DispatchError {
    pub fn is_missing_device(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::MissingDevice(_)))
    }

    pub fn is_missing_property(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::MissingProperty { .. }))
    }

    fn invalid(tag: &str, name: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            tag: tag.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Applies inbound commands to a [`Registry`]
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    /// Device name to the label used when that device is created
    labels: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_labels(labels: HashMap<String, String>) -> Self {
        Self { labels }
    }

    /// Apply one top-level element and return the command it carried
    pub fn dispatch(
        &self,
        registry: &mut Registry,
        element: &XmlElement,
    ) -> Result<Command, DispatchError> {
        let command = Command::from_tag(&element.tag);
        match &command {
            Command::Message => handle_message(registry, element),
            Command::DelProperty => handle_del_property(registry, element)?,
            Command::Define(kind) => self.handle_define(registry, *kind, element)?,
            Command::Set(kind) => handle_set(registry, *kind, element)?,
            Command::Unknown(tag) => return Err(DispatchError::UnknownTag(tag.clone())),
        }
        Ok(command)
    }

    fn handle_define(
        &self,
        registry: &mut Registry,
        kind: PropertyKind,
        element: &XmlElement,
    ) -> Result<(), DispatchError> {
        let device = required(element, "device")?;
        let property = build_property(kind, element)?;
        let label = self.labels.get(device).map(String::as_str);
        registry.define_property(device, label, property)?;
        check_message(registry, element);
        Ok(())
    }
}

fn required<'a>(element: &'a XmlElement, attribute: &'static str) -> Result<&'a str, DispatchError> {
    element
        .attr(attribute)
        .ok_or_else(|| DispatchError::MissingAttribute {
            tag: element.tag.clone(),
            attribute,
        })
}

fn keyword<T>(element: &XmlElement, attribute: &str) -> Result<Option<T>, DispatchError>
where
    T: std::str::FromStr<Err = UnknownKeyword>,
{
    element
        .attr(attribute)
        .map(|value| value.parse::<T>())
        .transpose()
        .map_err(|e| DispatchError::invalid(&element.tag, attribute, e))
}

fn number_attr(element: &XmlElement, attribute: &str) -> Result<Option<f64>, DispatchError> {
    element
        .attr(attribute)
        .map(|raw| {
            parse_number(raw).ok_or_else(|| {
                DispatchError::invalid(&element.tag, attribute, format!("'{raw}' is not a number"))
            })
        })
        .transpose()
}

/// Publish the `message` attribute carried by any command
fn check_message(registry: &mut Registry, element: &XmlElement) {
    if let Some(message) = Message::from_element(element, Utc::now()) {
        registry.log_message(message);
    }
}

fn handle_message(registry: &mut Registry, element: &XmlElement) {
    check_message(registry, element);
}

fn handle_del_property(registry: &mut Registry, element: &XmlElement) -> Result<(), DispatchError> {
    let device = required(element, "device")?;
    registry.find_device(device)?;
    check_message(registry, element);

    match element.attr("name") {
        Some(property) => {
            registry.remove_property(device, property)?;
        }
        None => registry.remove_device(DeviceSelector::Named(device))?,
    }
    Ok(())
}

fn handle_set(
    registry: &mut Registry,
    kind: PropertyKind,
    element: &XmlElement,
) -> Result<(), DispatchError> {
    let device = required(element, "device")?;
    let name = required(element, "name")?;

    let property = registry.find_property_mut(device, name)?;
    if property.kind() != kind {
        return Err(DispatchError::KindMismatch {
            tag: element.tag.clone(),
            device: device.to_string(),
            property: name.to_string(),
            actual: property.kind(),
        });
    }
    apply_update(property, element)?;

    registry.property_updated(device, name);
    check_message(registry, element);
    Ok(())
}

/// Build a property from a `def*Vector` element
fn build_property(kind: PropertyKind, element: &XmlElement) -> Result<Property, DispatchError> {
    let tag = element.tag.as_str();
    let mut property = Property::new(required(element, "name")?, kind);

    if let Some(label) = element.attr("label") {
        property.label = label.to_string();
    }
    property.group = element.attr("group").unwrap_or_default().to_string();
    property.state = keyword(element, "state")?.unwrap_or_default();
    if kind != PropertyKind::Light {
        property.permission = keyword(element, "perm")?;
    }
    if kind == PropertyKind::Switch {
        property.rule = keyword(element, "rule")?;
    }
    property.timeout = number_attr(element, "timeout")?.unwrap_or(0.0);
    property.timestamp = element.attr("timestamp").map(str::to_string);

    for child in element.children_tagged(kind.def_element_tag()) {
        let name = required(child, "name")?;
        let text = child.trimmed_text();
        let value = match kind {
            PropertyKind::Text => ElementValue::Text(text.to_string()),
            PropertyKind::Number => {
                let value = parse_number(text).ok_or_else(|| {
                    DispatchError::invalid(tag, name, format!("'{text}' is not a number"))
                })?;
                let mut number = NumberValue::new(value);
                number.min = number_attr(child, "min")?.unwrap_or(0.0);
                number.max = number_attr(child, "max")?.unwrap_or(0.0);
                number.step = number_attr(child, "step")?.unwrap_or(0.0);
                if let Some(format) = child.attr("format") {
                    number.format = format.to_string();
                }
                ElementValue::Number(number)
            }
            PropertyKind::Switch => {
                ElementValue::Switch(text.parse().map_err(|e| DispatchError::invalid(tag, name, e))?)
            }
            PropertyKind::Light => {
                ElementValue::Light(text.parse().map_err(|e| DispatchError::invalid(tag, name, e))?)
            }
            PropertyKind::Blob => ElementValue::Blob(BlobValue {
                format: child.attr("format").unwrap_or_default().to_string(),
                ..BlobValue::default()
            }),
        };

        let mut entry = Element::new(name, value);
        if let Some(label) = child.attr("label") {
            entry.label = label.to_string();
        }
        if let Err(duplicate) = property.push_element(entry) {
            debug!(tag, element = %duplicate.name, "Ignoring duplicate element in definition");
        }
    }

    Ok(property)
}

/// Apply a `set*Vector` element to an existing property of the same kind.
///
/// All values are decoded before anything is written, so a bad value leaves
/// the property untouched.
fn apply_update(property: &mut Property, element: &XmlElement) -> Result<(), DispatchError> {
    let tag = element.tag.as_str();
    let kind = property.kind();
    let state = keyword(element, "state")?;
    let timeout = number_attr(element, "timeout")?;

    let mut updates = Vec::new();
    for child in element.children_tagged(kind.one_element_tag()) {
        let name = required(child, "name")?;
        let Some(index) = property.element_index(name) else {
            debug!(tag, property = %property.name, element = name, "Ignoring unknown element");
            continue;
        };
        let text = child.trimmed_text();
        let value = match &property.elements()[index].value {
            ElementValue::Text(_) => ElementValue::Text(text.to_string()),
            ElementValue::Number(current) => {
                let mut number = current.clone();
                number.value = parse_number(text).ok_or_else(|| {
                    DispatchError::invalid(tag, name, format!("'{text}' is not a number"))
                })?;
                if let Some(min) = number_attr(child, "min")? {
                    number.min = min;
                }
                if let Some(max) = number_attr(child, "max")? {
                    number.max = max;
                }
                if let Some(step) = number_attr(child, "step")? {
                    number.step = step;
                }
                ElementValue::Number(number)
            }
            ElementValue::Switch(_) => {
                ElementValue::Switch(text.parse().map_err(|e| DispatchError::invalid(tag, name, e))?)
            }
            ElementValue::Light(_) => {
                ElementValue::Light(text.parse().map_err(|e| DispatchError::invalid(tag, name, e))?)
            }
            ElementValue::Blob(_) => ElementValue::Blob(decode_blob(tag, name, child)?),
        };
        updates.push((index, value));
    }

    if let Some(state) = state {
        property.state = state;
    }
    if let Some(timeout) = timeout {
        property.timeout = timeout;
    }
    if let Some(timestamp) = element.attr("timestamp") {
        property.timestamp = Some(timestamp.to_string());
    }
    for (index, value) in updates {
        // index and kind were checked above
        let _ = property.update_value(index, value);
    }
    Ok(())
}

/// Decode the base64 body of a `oneBLOB` element
fn decode_blob(tag: &str, name: &str, child: &XmlElement) -> Result<BlobValue, DispatchError> {
    let encoded: String = child.text.split_ascii_whitespace().collect();
    let data = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| DispatchError::invalid(tag, name, e))?;
    let size = match child.attr("size") {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|e| DispatchError::invalid(tag, name, e))?,
        None => data.len(),
    };
    Ok(BlobValue {
        size,
        format: child.attr("format").unwrap_or_default().to_string(),
        data,
    })
}
