//! indilink core - INDI protocol engine without I/O
//!
//! This crate holds everything about an INDI client session that does not
//! touch a socket:
//! - Incremental XML framing of the inbound byte stream
//! - Command dispatch from parsed elements into the device registry
//! - The device / property / element model and its change events
//! - Serialization of outbound commands, including framed BLOB uploads

pub mod device;
pub mod dispatch;
pub mod message;
pub mod parser;
pub mod protocol;
pub mod registry;
pub mod serializer;
pub mod xml;

pub use device::{BlobValue, Device, Element, ElementValue, NumberValue, Property};
pub use dispatch::{DispatchError, Dispatcher};
pub use message::{Message, TimestampSource};
pub use parser::{ParseError, StreamParser};
pub use protocol::{
    BlobMode, Command, Permission, PropertyKind, PropertyState, SwitchRule, SwitchState,
    INDI_PORT, PROTOCOL_VERSION,
};
pub use registry::{DeviceSelector, Registry, RegistryError, RegistryEvent};
pub use serializer::{Serializer, WireError};
pub use xml::XmlElement;
