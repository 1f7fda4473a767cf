//! One-shot commands given on the command line
//!
//! Each command names its target as `DEVICE/PROPERTY/ELEMENT=VALUE` and is
//! sent once the server has defined the target property.

use anyhow::{Context, Result};
use indilink_client::Client;
use indilink_core::protocol::parse_number;
use indilink_core::{Registry, SwitchState};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("expected DEVICE/PROPERTY/ELEMENT=VALUE, got {0:?}")]
    Malformed(String),
    #[error("invalid value {value:?} in {arg:?}: {reason}")]
    InvalidValue {
        arg: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub device: String,
    pub property: String,
    pub element: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Text(String),
    Number(f64),
    Switch(SwitchState),
    /// Upload a file; the format is its extension with a leading dot
    Upload { path: PathBuf, format: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub target: Target,
    pub action: Action,
}

/// Split `DEVICE/PROPERTY/ELEMENT=VALUE`. Device names may contain `/`, so
/// the property and element are taken from the right.
fn split(arg: &str) -> Result<(Target, &str), CommandError> {
    let malformed = || CommandError::Malformed(arg.to_string());
    let (path, value) = arg.split_once('=').ok_or_else(malformed)?;
    let mut parts = path.rsplitn(3, '/');
    let element = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let property = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let device = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    Ok((
        Target {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
        },
        value,
    ))
}

fn invalid(arg: &str, value: &str, reason: impl ToString) -> CommandError {
    CommandError::InvalidValue {
        arg: arg.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl PendingCommand {
    pub fn text(arg: &str) -> Result<Self, CommandError> {
        let (target, value) = split(arg)?;
        Ok(Self {
            target,
            action: Action::Text(value.to_string()),
        })
    }

    /// Numbers may be sexagesimal, as in `12:30:00`
    pub fn number(arg: &str) -> Result<Self, CommandError> {
        let (target, value) = split(arg)?;
        let number = parse_number(value).ok_or_else(|| invalid(arg, value, "not a number"))?;
        Ok(Self {
            target,
            action: Action::Number(number),
        })
    }

    pub fn switch(arg: &str) -> Result<Self, CommandError> {
        let (target, value) = split(arg)?;
        let state = value.parse().map_err(|e| invalid(arg, value, e))?;
        Ok(Self {
            target,
            action: Action::Switch(state),
        })
    }

    pub fn upload(arg: &str) -> Result<Self, CommandError> {
        let (target, value) = split(arg)?;
        let path = PathBuf::from(value);
        let format = upload_format(&path).ok_or_else(|| invalid(arg, value, "file has no extension"))?;
        Ok(Self {
            target,
            action: Action::Upload { path, format },
        })
    }

    /// True once the target property is defined
    pub fn is_ready(&self, registry: &Registry) -> bool {
        registry
            .find_property(&self.target.device, &self.target.property)
            .is_ok()
    }

    pub async fn execute(&self, client: &mut Client) -> Result<()> {
        let Target {
            device,
            property,
            element,
        } = &self.target;
        match &self.action {
            Action::Text(text) => {
                client
                    .send_text(device, property, &[(element.as_str(), text.as_str())])
                    .await?
            }
            Action::Number(value) => {
                client
                    .send_number(device, property, &[(element.as_str(), *value)])
                    .await?
            }
            Action::Switch(state) => client.send_switch(device, property, element, *state).await?,
            Action::Upload { path, format } => {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                client
                    .upload_blob(device, property, element, format, &data)
                    .await?
            }
        }
        info!(device = %device, property = %property, element = %element, "Command sent");
        Ok(())
    }
}

/// `.fits` for `image.fits`, `.fits.z` for `image.fits.z`
fn upload_format(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let (dot, _) = name.char_indices().skip(1).find(|(_, c)| *c == '.')?;
    Some(name[dot..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_command() {
        let command = PendingCommand::number("Telescope Simulator/EQ_COORD/RA=12:30:00").unwrap();
        assert_eq!(command.target.device, "Telescope Simulator");
        assert_eq!(command.target.property, "EQ_COORD");
        assert_eq!(command.target.element, "RA");
        assert_eq!(command.action, Action::Number(12.5));
    }

    #[test]
    fn test_device_name_with_slash() {
        let command = PendingCommand::text("Cam/1/FILE/PATH=/tmp/a=b").unwrap();
        assert_eq!(command.target.device, "Cam/1");
        assert_eq!(command.target.property, "FILE");
        assert_eq!(command.target.element, "PATH");
        assert_eq!(command.action, Action::Text("/tmp/a=b".to_string()));
    }

    #[test]
    fn test_malformed_commands() {
        assert!(matches!(
            PendingCommand::text("CCD/EXPOSURE=1"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            PendingCommand::text("CCD/EXPOSURE/VALUE"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            PendingCommand::number("CCD/EXPOSURE/VALUE=soon"),
            Err(CommandError::InvalidValue { .. })
        ));
        assert!(matches!(
            PendingCommand::switch("CCD/CONNECTION/CONNECT=Maybe"),
            Err(CommandError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_switch_and_upload() {
        let command = PendingCommand::switch("CCD/CONNECTION/CONNECT=On").unwrap();
        assert_eq!(command.action, Action::Switch(SwitchState::On));

        let command = PendingCommand::upload("CCD/UPLOAD/FILE=/data/m31.fits.z").unwrap();
        assert_eq!(
            command.action,
            Action::Upload {
                path: PathBuf::from("/data/m31.fits.z"),
                format: ".fits.z".to_string()
            }
        );
        assert!(PendingCommand::upload("CCD/UPLOAD/FILE=/data/README").is_err());
        assert!(PendingCommand::upload("CCD/UPLOAD/FILE=/data/.hidden").is_err());
    }

    #[test]
    fn test_upload_format_after_multibyte_start() {
        assert_eq!(
            upload_format(Path::new("/data/été.fits")),
            Some(".fits".to_string())
        );
        assert_eq!(upload_format(Path::new("é.txt")), Some(".txt".to_string()));
    }

    #[test]
    fn test_ready_when_property_defined() {
        use indilink_core::{Element, ElementValue, Property, PropertyKind};

        let command = PendingCommand::switch("CCD/CONNECTION/CONNECT=On").unwrap();
        let mut registry = Registry::new();
        assert!(!command.is_ready(&registry));

        let mut property = Property::new("CONNECTION", PropertyKind::Switch);
        property
            .push_element(Element::new("CONNECT", ElementValue::Switch(SwitchState::Off)))
            .unwrap();
        registry.define_property("CCD", None, property).unwrap();
        assert!(command.is_ready(&registry));
    }
}
