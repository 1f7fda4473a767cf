//! Informational messages sent by drivers

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::xml::XmlElement;

/// Where a message timestamp came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Sent by the server in the `timestamp` attribute
    Reported,
    /// Stamped locally at receipt
    Received,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Device named by the command, if any
    pub device: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: TimestampSource,
    pub text: String,
}

impl Message {
    /// Message stamped with the current time
    pub fn received(device: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            device: device.map(str::to_string),
            timestamp: Utc::now(),
            source: TimestampSource::Received,
            text: text.into(),
        }
    }

    /// Extract the `message` attribute of a command, if it has one.
    ///
    /// Without a usable `timestamp` attribute the message is stamped with
    /// `now`.
    pub fn from_element(element: &XmlElement, now: DateTime<Utc>) -> Option<Self> {
        let text = element.attr("message")?;
        let device = element.attr("device").map(str::to_string);

        let reported = element.attr("timestamp").and_then(|raw| {
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                debug!(timestamp = raw, "Unparseable message timestamp, using receipt time");
            }
            parsed
        });

        let (timestamp, source) = match reported {
            Some(timestamp) => (timestamp, TimestampSource::Reported),
            None => (now, TimestampSource::Received),
        };

        Some(Self {
            device,
            timestamp,
            source,
            text: text.to_string(),
        })
    }
}

/// Parse an INDI timestamp (`YYYY-MM-DDTHH:MM:SS[.fff]`, UTC) or RFC 3339
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
