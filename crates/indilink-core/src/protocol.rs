//! INDI wire vocabulary
//!
//! Tag names, attribute enumerations and number parsing shared by the
//! dispatcher (inbound) and the serializer (outbound).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default INDI protocol version announced in `getProperties`
pub const PROTOCOL_VERSION: &str = "1.7";

/// Default TCP port of an INDI server
pub const INDI_PORT: u16 = 7624;

/// Error returned when an attribute or element text is not a known keyword
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {what} '{value}'")]
pub struct UnknownKeyword {
    pub what: &'static str,
    pub value: String,
}

impl UnknownKeyword {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Kind of a property vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyKind {
    pub const ALL: [PropertyKind; 5] = [
        PropertyKind::Text,
        PropertyKind::Number,
        PropertyKind::Switch,
        PropertyKind::Light,
        PropertyKind::Blob,
    ];

    /// Tag of the inbound definition command (`defNumberVector`)
    pub fn def_vector_tag(self) -> &'static str {
        match self {
            Self::Text => "defTextVector",
            Self::Number => "defNumberVector",
            Self::Switch => "defSwitchVector",
            Self::Light => "defLightVector",
            Self::Blob => "defBLOBVector",
        }
    }

    /// Tag of the elements inside a definition (`defNumber`)
    pub fn def_element_tag(self) -> &'static str {
        match self {
            Self::Text => "defText",
            Self::Number => "defNumber",
            Self::Switch => "defSwitch",
            Self::Light => "defLight",
            Self::Blob => "defBLOB",
        }
    }

    /// Tag of the inbound update command (`setNumberVector`)
    pub fn set_vector_tag(self) -> &'static str {
        match self {
            Self::Text => "setTextVector",
            Self::Number => "setNumberVector",
            Self::Switch => "setSwitchVector",
            Self::Light => "setLightVector",
            Self::Blob => "setBLOBVector",
        }
    }

    /// Tag of the elements inside set and new commands (`oneNumber`)
    pub fn one_element_tag(self) -> &'static str {
        match self {
            Self::Text => "oneText",
            Self::Number => "oneNumber",
            Self::Switch => "oneSwitch",
            Self::Light => "oneLight",
            Self::Blob => "oneBLOB",
        }
    }

    /// Tag of the outbound command, lights are read-only and have none
    pub fn new_vector_tag(self) -> Option<&'static str> {
        match self {
            Self::Text => Some("newTextVector"),
            Self::Number => Some("newNumberVector"),
            Self::Switch => Some("newSwitchVector"),
            Self::Light => None,
            Self::Blob => Some("newBLOBVector"),
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Switch => "switch",
            Self::Light => "light",
            Self::Blob => "BLOB",
        };
        f.write_str(name)
    }
}

/// Inbound command, decided by the root tag of a parsed element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Message,
    DelProperty,
    Define(PropertyKind),
    Set(PropertyKind),
    Unknown(String),
}

impl Command {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "message" => Self::Message,
            "delProperty" => Self::DelProperty,
            "defTextVector" => Self::Define(PropertyKind::Text),
            "defNumberVector" => Self::Define(PropertyKind::Number),
            "defSwitchVector" => Self::Define(PropertyKind::Switch),
            "defLightVector" => Self::Define(PropertyKind::Light),
            "defBLOBVector" => Self::Define(PropertyKind::Blob),
            "setTextVector" => Self::Set(PropertyKind::Text),
            "setNumberVector" => Self::Set(PropertyKind::Number),
            "setSwitchVector" => Self::Set(PropertyKind::Switch),
            "setLightVector" => Self::Set(PropertyKind::Light),
            "setBLOBVector" => Self::Set(PropertyKind::Blob),
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Property state, also the value of a light element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Ok => "Ok",
            Self::Busy => "Busy",
            Self::Alert => "Alert",
        }
    }
}

impl FromStr for PropertyState {
    type Err = UnknownKeyword;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Idle" => Ok(Self::Idle),
            "Ok" => Ok(Self::Ok),
            "Busy" => Ok(Self::Busy),
            "Alert" => Ok(Self::Alert),
            other => Err(UnknownKeyword::new("state", other)),
        }
    }
}

/// Client access to a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "wo")]
    WriteOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::WriteOnly => "wo",
            Self::ReadWrite => "rw",
        }
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

impl FromStr for Permission {
    type Err = UnknownKeyword;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ro" => Ok(Self::ReadOnly),
            "wo" => Ok(Self::WriteOnly),
            "rw" => Ok(Self::ReadWrite),
            other => Err(UnknownKeyword::new("permission", other)),
        }
    }
}

/// How many switches of a vector may be on at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

impl FromStr for SwitchRule {
    type Err = UnknownKeyword;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "OneOfMany" => Ok(Self::OneOfMany),
            "AtMostOne" => Ok(Self::AtMostOne),
            "AnyOfMany" => Ok(Self::AnyOfMany),
            other => Err(UnknownKeyword::new("switch rule", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchState {
    On,
    #[default]
    Off,
}

impl SwitchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "On",
            Self::Off => "Off",
        }
    }
}

impl FromStr for SwitchState {
    type Err = UnknownKeyword;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "On" => Ok(Self::On),
            "Off" => Ok(Self::Off),
            other => Err(UnknownKeyword::new("switch state", other)),
        }
    }
}

/// BLOB delivery policy requested with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlobMode {
    Never,
    #[default]
    Also,
    Only,
}

impl BlobMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "Never",
            Self::Also => "Also",
            Self::Only => "Only",
        }
    }
}

impl FromStr for BlobMode {
    type Err = UnknownKeyword;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Never" => Ok(Self::Never),
            "Also" => Ok(Self::Also),
            "Only" => Ok(Self::Only),
            other => Err(UnknownKeyword::new("BLOB mode", other)),
        }
    }
}

/// Parse an INDI number: a plain float or sexagesimal `d:m:s` / `d m s`.
///
/// The sign of a sexagesimal value applies to the whole value, so
/// `-10:30` is -10.5.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<f64>() {
        return Some(value);
    }

    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let parts = body
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .ok()?;

    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_sign_negative()) {
        return None;
    }

    let value: f64 = parts
        .iter()
        .zip([1.0, 60.0, 3600.0])
        .map(|(part, divisor)| part / divisor)
        .sum();

    Some(if negative { -value } else { value })
}

/// Format a number for the wire; shortest representation that round-trips
pub fn format_number(value: f64) -> String {
    value.to_string()
}
