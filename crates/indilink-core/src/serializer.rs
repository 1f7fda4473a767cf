//! Outbound INDI commands
//!
//! Each call writes one complete command (or one BLOB frame phase) to the
//! given writer. Nothing is buffered between calls. BLOB uploads follow a
//! strict start / chunk / finish sequence which the serializer tracks, and
//! no other command may be written while a BLOB frame is open.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Write;
use thiserror::Error;
use tracing::debug;

use crate::device::Property;
use crate::protocol::{format_number, BlobMode, PropertyKind, SwitchState};

/// Column width of base64 lines in a `oneBLOB` body
pub const BLOB_LINE_WIDTH: usize = 72;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML write error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("BLOB frame for {device}.{property} is still open")]
    BlobFrameAlreadyOpen { device: String, property: String },
    #[error("no BLOB frame is open")]
    BlobFrameNotOpen,
    #[error("switch index {index} out of range for {property} with {len} elements")]
    IndexOutOfRange {
        property: String,
        index: usize,
        len: usize,
    },
    #[error("{property} is a {actual} property, expected {expected}")]
    KindMismatch {
        property: String,
        actual: PropertyKind,
        expected: PropertyKind,
    },
    #[error("{0} properties cannot be written")]
    ReadOnlyKind(PropertyKind),
    #[error("BLOB {name} declares {size} bytes but only {available} were given")]
    BlobTooShort {
        name: String,
        size: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenFrame {
    device: String,
    property: String,
}

/// Writes outbound commands and tracks BLOB framing
#[derive(Debug, Default)]
pub struct Serializer {
    frame: Option<OpenFrame>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `start_blob` and `finish_blob`
    pub fn blob_frame_open(&self) -> bool {
        self.frame.is_some()
    }

    /// Forget any open BLOB frame, used when the connection goes away
    pub fn reset(&mut self) {
        self.frame = None;
    }

    fn ensure_no_frame(&self) -> Result<(), WireError> {
        match &self.frame {
            Some(frame) => Err(WireError::BlobFrameAlreadyOpen {
                device: frame.device.clone(),
                property: frame.property.clone(),
            }),
            None => Ok(()),
        }
    }

    /// `<enableBLOB>Also</enableBLOB>`
    pub fn enable_blob<W: Write>(&self, out: &mut W, mode: BlobMode) -> Result<(), WireError> {
        self.ensure_no_frame()?;
        let mut writer = Writer::new(&mut *out);
        writer
            .create_element("enableBLOB")
            .write_text_content(BytesText::new(mode.as_str()))?;
        out.write_all(b"\n")?;
        Ok(())
    }

    /// `<getProperties version="1.7"/>`
    pub fn get_properties<W: Write>(&self, out: &mut W, version: &str) -> Result<(), WireError> {
        self.ensure_no_frame()?;
        let mut writer = Writer::new(&mut *out);
        writer
            .create_element("getProperties")
            .with_attribute(("version", version))
            .write_empty()?;
        out.write_all(b"\n")?;
        Ok(())
    }

    pub fn new_text_vector<W: Write>(
        &self,
        out: &mut W,
        device: &str,
        property: &str,
        values: &[(&str, &str)],
    ) -> Result<(), WireError> {
        self.ensure_no_frame()?;
        let values = values.iter().map(|(name, text)| (*name, text.to_string()));
        write_vector(out, PropertyKind::Text, device, property, values)
    }

    pub fn new_number_vector<W: Write>(
        &self,
        out: &mut W,
        device: &str,
        property: &str,
        values: &[(&str, f64)],
    ) -> Result<(), WireError> {
        self.ensure_no_frame()?;
        let values = values.iter().map(|(name, value)| (*name, format_number(*value)));
        write_vector(out, PropertyKind::Number, device, property, values)
    }

    /// Send the state of exactly one switch, chosen by its index
    pub fn new_switch_vector<W: Write>(
        &self,
        out: &mut W,
        device: &str,
        property: &Property,
        index: usize,
        state: SwitchState,
    ) -> Result<(), WireError> {
        self.ensure_no_frame()?;
        if property.kind() != PropertyKind::Switch {
            return Err(WireError::KindMismatch {
                property: property.name.clone(),
                actual: property.kind(),
                expected: PropertyKind::Switch,
            });
        }
        let element = property
            .elements()
            .get(index)
            .ok_or_else(|| WireError::IndexOutOfRange {
                property: property.name.clone(),
                index,
                len: property.elements().len(),
            })?;
        let values = std::iter::once((element.name.as_str(), state.as_str().to_string()));
        write_vector(out, PropertyKind::Switch, device, &property.name, values)
    }

    /// Open a `newBLOBVector` frame
    pub fn start_blob<W: Write>(
        &mut self,
        out: &mut W,
        device: &str,
        property: &str,
        timestamp: &str,
    ) -> Result<(), WireError> {
        self.ensure_no_frame()?;
        let mut writer = Writer::new(&mut *out);
        let start = BytesStart::new("newBLOBVector").with_attributes([
            ("device", device),
            ("name", property),
            ("timestamp", timestamp),
        ]);
        writer.write_event(Event::Start(start))?;
        out.write_all(b"\n")?;

        debug!(device, property, "BLOB frame opened");
        self.frame = Some(OpenFrame {
            device: device.to_string(),
            property: property.to_string(),
        });
        Ok(())
    }

    /// Write one `oneBLOB` holding the first `size` bytes of `data`
    pub fn send_one_blob<W: Write>(
        &self,
        out: &mut W,
        name: &str,
        size: usize,
        format: &str,
        data: &[u8],
    ) -> Result<(), WireError> {
        if self.frame.is_none() {
            return Err(WireError::BlobFrameNotOpen);
        }
        let payload = data.get(..size).ok_or_else(|| WireError::BlobTooShort {
            name: name.to_string(),
            size,
            available: data.len(),
        })?;

        let size = size.to_string();
        out.write_all(b"  ")?;
        let mut writer = Writer::new(&mut *out);
        let start = BytesStart::new("oneBLOB").with_attributes([
            ("name", name),
            ("size", size.as_str()),
            ("format", format),
        ]);
        writer.write_event(Event::Start(start))?;
        writer.write_event(Event::Text(BytesText::new(&wrap_base64(payload))))?;
        writer.write_event(Event::End(BytesEnd::new("oneBLOB")))?;
        out.write_all(b"\n")?;
        Ok(())
    }

    /// Close the open `newBLOBVector` frame
    pub fn finish_blob<W: Write>(&mut self, out: &mut W) -> Result<(), WireError> {
        let frame = self.frame.take().ok_or(WireError::BlobFrameNotOpen)?;
        let mut writer = Writer::new(&mut *out);
        writer.write_event(Event::End(BytesEnd::new("newBLOBVector")))?;
        out.write_all(b"\n")?;
        debug!(device = %frame.device, property = %frame.property, "BLOB frame closed");
        Ok(())
    }
}

/// `<newXVector device= name=>` with one `oneX` child per value
fn write_vector<'a, W: Write>(
    out: &mut W,
    kind: PropertyKind,
    device: &str,
    property: &str,
    values: impl Iterator<Item = (&'a str, String)>,
) -> Result<(), WireError> {
    let tag = kind.new_vector_tag().ok_or(WireError::ReadOnlyKind(kind))?;
    let mut writer = Writer::new_with_indent(&mut *out, b' ', 2);
    let start = BytesStart::new(tag).with_attributes([("device", device), ("name", property)]);
    writer.write_event(Event::Start(start))?;
    for (name, value) in values {
        writer
            .create_element(kind.one_element_tag())
            .with_attribute(("name", name))
            .write_text_content(BytesText::new(&value))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Base64 of `data` wrapped at [`BLOB_LINE_WIDTH`], one line per row
fn wrap_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / BLOB_LINE_WIDTH + 2);
    wrapped.push('\n');
    for line in encoded.as_bytes().chunks(BLOB_LINE_WIDTH) {
        // base64 output is ASCII
        wrapped.push_str(std::str::from_utf8(line).unwrap_or_default());
        wrapped.push('\n');
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Element, ElementValue};
    use crate::parser::StreamParser;
    use crate::xml::XmlElement;

    fn parse(bytes: &[u8]) -> Vec<XmlElement> {
        StreamParser::new()
            .feed(bytes)
            .into_iter()
            .map(|r| r.expect("serializer output should parse"))
            .collect()
    }

    fn switch_property() -> Property {
        let mut property = Property::new("CONNECTION", PropertyKind::Switch);
        for name in ["CONNECT", "DISCONNECT"] {
            property
                .push_element(Element::new(name, ElementValue::Switch(SwitchState::Off)))
                .unwrap();
        }
        property
    }

    #[test]
    fn test_handshake() {
        let serializer = Serializer::new();
        let mut out = Vec::new();
        serializer.enable_blob(&mut out, BlobMode::Also).unwrap();
        serializer.get_properties(&mut out, "1.7").unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<enableBLOB>Also</enableBLOB>\n<getProperties version=\"1.7\"/>\n"
        );
    }

    #[test]
    fn test_new_number_vector() {
        let serializer = Serializer::new();
        let mut out = Vec::new();
        serializer
            .new_number_vector(&mut out, "Telescope", "EQ_COORD", &[("RA", 12.5), ("DEC", -3.0)])
            .unwrap();

        let elements = parse(&out);
        assert_eq!(elements.len(), 1);
        let root = &elements[0];
        assert_eq!(root.tag, "newNumberVector");
        assert_eq!(root.attr("device"), Some("Telescope"));
        assert_eq!(root.attr("name"), Some("EQ_COORD"));
        let values: Vec<(&str, &str)> = root
            .children_tagged("oneNumber")
            .map(|c| (c.attr("name").unwrap(), c.trimmed_text()))
            .collect();
        assert_eq!(values, vec![("RA", "12.5"), ("DEC", "-3")]);
    }

    #[test]
    fn test_new_text_vector_escapes() {
        let serializer = Serializer::new();
        let mut out = Vec::new();
        serializer
            .new_text_vector(&mut out, "CCD <1>", "FILE", &[("PATH", "a&b")])
            .unwrap();
        let root = &parse(&out)[0];
        assert_eq!(root.attr("device"), Some("CCD <1>"));
        assert_eq!(root.children[0].trimmed_text(), "a&b");
    }

    #[test]
    fn test_new_switch_vector_sends_one_element() {
        let serializer = Serializer::new();
        let property = switch_property();
        let mut out = Vec::new();
        serializer
            .new_switch_vector(&mut out, "CCD", &property, 1, SwitchState::On)
            .unwrap();
        let root = &parse(&out)[0];
        assert_eq!(root.tag, "newSwitchVector");
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].attr("name"), Some("DISCONNECT"));
        assert_eq!(root.children[0].trimmed_text(), "On");

        let err = serializer
            .new_switch_vector(&mut Vec::new(), "CCD", &property, 2, SwitchState::On)
            .unwrap_err();
        assert!(matches!(err, WireError::IndexOutOfRange { index: 2, len: 2, .. }));
    }

    #[test]
    fn test_blob_round_trip() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut serializer = Serializer::new();
        let mut out = Vec::new();

        serializer
            .start_blob(&mut out, "CCD", "UPLOAD", "2024-03-01T21:15:30")
            .unwrap();
        for chunk in original.chunks(300) {
            serializer
                .send_one_blob(&mut out, "FILE", chunk.len(), ".bin", chunk)
                .unwrap();
        }
        serializer.finish_blob(&mut out).unwrap();
        assert!(!serializer.blob_frame_open());

        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.lines().all(|line| line.trim().len() <= BLOB_LINE_WIDTH
            || line.trim_start().starts_with('<')));

        let elements = parse(&out);
        assert_eq!(elements.len(), 1);
        let root = &elements[0];
        assert_eq!(root.tag, "newBLOBVector");
        assert_eq!(root.attr("timestamp"), Some("2024-03-01T21:15:30"));

        let mut rebuilt = Vec::new();
        for chunk in root.children_tagged("oneBLOB") {
            let encoded: String = chunk.text.split_ascii_whitespace().collect();
            let decoded = STANDARD.decode(encoded).unwrap();
            let size: usize = chunk.attr("size").unwrap().parse().unwrap();
            assert_eq!(decoded.len(), size);
            rebuilt.extend(decoded);
        }
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_blob_size_limits_payload() {
        let mut serializer = Serializer::new();
        let mut out = Vec::new();
        serializer.start_blob(&mut out, "CCD", "UPLOAD", "t").unwrap();
        serializer
            .send_one_blob(&mut out, "FILE", 5, ".txt", b"hello world")
            .unwrap();
        let err = serializer
            .send_one_blob(&mut out, "FILE", 50, ".txt", b"short")
            .unwrap_err();
        assert!(matches!(err, WireError::BlobTooShort { size: 50, available: 5, .. }));
    }

    #[test]
    fn test_blob_framing_is_guarded() {
        let mut serializer = Serializer::new();
        let mut out = Vec::new();

        assert!(matches!(
            serializer.send_one_blob(&mut out, "F", 0, ".bin", &[]),
            Err(WireError::BlobFrameNotOpen)
        ));
        assert!(matches!(
            serializer.finish_blob(&mut out),
            Err(WireError::BlobFrameNotOpen)
        ));
        assert!(out.is_empty());

        serializer.start_blob(&mut out, "CCD", "UPLOAD", "t").unwrap();
        assert!(matches!(
            serializer.start_blob(&mut out, "CCD", "OTHER", "t"),
            Err(WireError::BlobFrameAlreadyOpen { .. })
        ));
        assert!(matches!(
            serializer.new_text_vector(&mut out, "CCD", "X", &[]),
            Err(WireError::BlobFrameAlreadyOpen { .. })
        ));

        serializer.reset();
        assert!(!serializer.blob_frame_open());
        serializer.start_blob(&mut Vec::new(), "CCD", "UPLOAD", "t").unwrap();
    }
}
