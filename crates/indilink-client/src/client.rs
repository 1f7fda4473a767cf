//! INDI client: handshake, read loop and outbound commands

use chrono::Utc;
use indilink_core::parser::DEFAULT_MAX_ELEMENT_LEN;
use indilink_core::{
    BlobMode, DeviceSelector, Dispatcher, ElementValue, ParseError, Property, PropertyKind,
    Registry, RegistryEvent, Serializer, SwitchState, XmlElement, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, ReadOutcome, Session};

/// Timestamp format of outbound BLOB frames
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sent in `getProperties`
    pub protocol_version: String,
    /// Sent in `enableBLOB`
    pub blob_mode: BlobMode,
    /// Largest inbound element accepted before it is discarded
    pub max_element_bytes: usize,
    /// Device name to the label given to that device on creation
    pub labels: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            blob_mode: BlobMode::default(),
            max_element_bytes: DEFAULT_MAX_ELEMENT_LEN,
            labels: HashMap::new(),
        }
    }
}

/// Connection state after a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Open,
    Closed,
}

/// A client for one INDI server at a time
pub struct Client {
    config: ClientConfig,
    registry: Registry,
    dispatcher: Dispatcher,
    serializer: Serializer,
    session: Option<Session>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            dispatcher: Dispatcher::with_labels(config.labels.clone()),
            config,
            registry: Registry::new(),
            serializer: Serializer::new(),
            session: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Subscribe to registry and connection events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(Session::peer)
    }

    /// Connect, send the handshake and start from an empty registry.
    ///
    /// On failure no connection state is kept.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            self.close("reconnecting");
        }

        let mut handshake = Vec::new();
        self.serializer
            .enable_blob(&mut handshake, self.config.blob_mode)?;
        self.serializer
            .get_properties(&mut handshake, &self.config.protocol_version)?;

        let session =
            Session::open(host, port, &handshake, self.config.max_element_bytes).await?;
        info!(host, port, peer = %session.peer(), "Connected to INDI server");

        // the server redefines everything after getProperties
        self.registry.remove_device(DeviceSelector::All)?;
        self.session = Some(session);
        Ok(())
    }

    /// Handle one read readiness event
    pub fn on_readable(&mut self) -> Result<ReadStatus, ConnectionError> {
        let session = self.session.as_mut().ok_or(ConnectionError::NotConnected)?;
        let outcome = match session.read_elements() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.close(&format!("input error: {e}"));
                return Ok(ReadStatus::Closed);
            }
        };

        match outcome {
            ReadOutcome::WouldBlock => Ok(ReadStatus::Open),
            ReadOutcome::Closed => {
                self.close("agent closed connection");
                Ok(ReadStatus::Closed)
            }
            ReadOutcome::Elements(results) => {
                for result in results {
                    self.handle_element(result);
                }
                Ok(ReadStatus::Open)
            }
        }
    }

    fn handle_element(&mut self, result: Result<XmlElement, ParseError>) {
        let element = match result {
            Ok(element) => element,
            Err(e) => {
                warn!(error = %e, "Malformed input");
                self.registry.emit(RegistryEvent::ProtocolError(e.to_string()));
                return;
            }
        };

        match self.dispatcher.dispatch(&mut self.registry, &element) {
            Ok(command) => debug!(
                command = ?command,
                device = element.attr("device").unwrap_or_default(),
                property = element.attr("name").unwrap_or_default(),
                "Dispatched"
            ),
            Err(e) => {
                warn!(tag = %element.tag, error = %e, "Command rejected");
                self.registry.emit(RegistryEvent::ProtocolError(e.to_string()));
            }
        }
    }

    /// Wait for read readiness, then read
    pub async fn poll(&mut self) -> Result<ReadStatus, ConnectionError> {
        let session = self.session.as_ref().ok_or(ConnectionError::NotConnected)?;
        if let Err(e) = session.readable().await {
            self.close(&format!("input error: {e}"));
            return Ok(ReadStatus::Closed);
        }
        self.on_readable()
    }

    /// Process input until the connection closes
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        while self.poll().await? == ReadStatus::Open {}
        Ok(())
    }

    /// Drop the connection and any partial input. Returns whether a
    /// connection was live. Registry contents are kept.
    pub fn teardown(&mut self) -> bool {
        self.serializer.reset();
        match self.session.take() {
            Some(session) => {
                debug!(peer = %session.peer(), "Session dropped");
                true
            }
            None => false,
        }
    }

    /// Close the connection on request
    pub fn disconnect(&mut self) {
        self.close("disconnected by client");
    }

    fn close(&mut self, cause: &str) {
        if self.teardown() {
            info!(cause, "Disconnected");
            self.registry.emit(RegistryEvent::Disconnected {
                cause: cause.to_string(),
            });
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        match self.session {
            Some(_) => Ok(()),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Look up a property the client may write
    fn writable(
        &self,
        device: &str,
        property: &str,
        kind: PropertyKind,
    ) -> Result<&Property, ConnectionError> {
        let found = self.registry.find_property(device, property)?;
        if found.kind() != kind {
            return Err(ConnectionError::Rejected(format!(
                "{device}.{property} is a {} property, not {kind}",
                found.kind()
            )));
        }
        if !found.is_writable() {
            return Err(ConnectionError::Rejected(format!(
                "{device}.{property} is read-only"
            )));
        }
        Ok(found)
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let session = self.session.as_mut().ok_or(ConnectionError::NotConnected)?;
        session.send(bytes).await.map_err(|e| {
            warn!(error = %e, "Write failed");
            ConnectionError::Io(e)
        })
    }

    pub async fn send_text(
        &mut self,
        device: &str,
        property: &str,
        values: &[(&str, &str)],
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let target = self.writable(device, property, PropertyKind::Text)?;
        check_elements(target, values.iter().map(|(name, _)| *name))?;

        let mut buf = Vec::new();
        self.serializer
            .new_text_vector(&mut buf, device, property, values)?;
        debug!(device, property, count = values.len(), "Sending text");
        self.send(&buf).await
    }

    /// Request new number values and record them as element targets
    pub async fn send_number(
        &mut self,
        device: &str,
        property: &str,
        values: &[(&str, f64)],
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let target = self.writable(device, property, PropertyKind::Number)?;
        check_elements(target, values.iter().map(|(name, _)| *name))?;

        let mut buf = Vec::new();
        self.serializer
            .new_number_vector(&mut buf, device, property, values)?;
        debug!(device, property, count = values.len(), "Sending numbers");
        self.send(&buf).await?;

        let target = self.registry.find_property_mut(device, property)?;
        for (name, value) in values {
            let Some(index) = target.element_index(name) else {
                continue;
            };
            if let ElementValue::Number(number) = &target.elements()[index].value {
                let mut number = number.clone();
                number.target = *value;
                let _ = target.update_value(index, ElementValue::Number(number));
            }
        }
        Ok(())
    }

    /// Set one switch of a switch property
    pub async fn send_switch(
        &mut self,
        device: &str,
        property: &str,
        element: &str,
        state: SwitchState,
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let target = self.writable(device, property, PropertyKind::Switch)?;
        let index = target.element_index(element).ok_or_else(|| {
            ConnectionError::Rejected(format!("{device}.{property} has no element {element}"))
        })?;

        let mut buf = Vec::new();
        self.serializer
            .new_switch_vector(&mut buf, device, target, index, state)?;
        debug!(device, property, element, state = state.as_str(), "Sending switch");
        self.send(&buf).await
    }

    /// Open a BLOB upload frame for a property
    pub async fn start_blob(&mut self, device: &str, property: &str) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.writable(device, property, PropertyKind::Blob)?;

        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let mut buf = Vec::new();
        self.serializer
            .start_blob(&mut buf, device, property, &timestamp)?;
        self.send_in_frame(&buf).await
    }

    /// Send the first `size` bytes of `data` as one BLOB element
    pub async fn send_one_blob(
        &mut self,
        name: &str,
        size: usize,
        format: &str,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let mut buf = Vec::new();
        self.serializer
            .send_one_blob(&mut buf, name, size, format, data)?;
        debug!(name, size, format, "Sending BLOB");
        self.send_in_frame(&buf).await
    }

    pub async fn finish_blob(&mut self) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let mut buf = Vec::new();
        self.serializer.finish_blob(&mut buf)?;
        self.send_in_frame(&buf).await
    }

    /// Write part of a BLOB frame. A failed write abandons the frame, since
    /// the server already holds a truncated one.
    async fn send_in_frame(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let result = self.send(bytes).await;
        if result.is_err() && self.serializer.blob_frame_open() {
            debug!("BLOB frame abandoned");
            self.serializer.reset();
        }
        result
    }

    /// Upload one buffer as a complete single-element BLOB frame
    pub async fn upload_blob(
        &mut self,
        device: &str,
        property: &str,
        name: &str,
        format: &str,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        let target = self.writable(device, property, PropertyKind::Blob)?;
        check_elements(target, std::iter::once(name))?;

        self.start_blob(device, property).await?;
        self.send_one_blob(name, data.len(), format, data).await?;
        self.finish_blob().await?;
        info!(device, property, name, bytes = data.len(), "BLOB uploaded");
        Ok(())
    }
}

fn check_elements<'a>(
    property: &Property,
    mut names: impl Iterator<Item = &'a str>,
) -> Result<(), ConnectionError> {
    match names.find(|name| property.element(name).is_none()) {
        Some(name) => Err(ConnectionError::Rejected(format!(
            "{} has no element {name}",
            property.name
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indilink_core::WireError;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const HANDSHAKE: &str = "<enableBLOB>Also</enableBLOB>\n<getProperties version=\"1.7\"/>\n";

    const DEF_EQ_COORD: &str = r#"<defNumberVector device="Telescope" name="EQ_COORD" label="Equatorial" group="Main" state="Idle" perm="rw" timeout="60">
  <defNumber name="RA" label="RA" format="%010.6m" min="0" max="24" step="0">0</defNumber>
  <defNumber name="DEC" label="Dec" format="%010.6m" min="-90" max="90" step="0">0</defNumber>
</defNumberVector>
"#;

    const SET_EQ_COORD: &str = r#"<setNumberVector device="Telescope" name="EQ_COORD" state="Ok">
  <oneNumber name="RA">12.5</oneNumber>
  <oneNumber name="DEC">-30:30:00</oneNumber>
</setNumberVector>
"#;

    const DEF_EXTRAS: &str = r#"<defSwitchVector device="Telescope" name="CONNECTION" perm="rw" rule="OneOfMany">
  <defSwitch name="CONNECT">Off</defSwitch>
  <defSwitch name="DISCONNECT">On</defSwitch>
</defSwitchVector>
<defTextVector device="Telescope" name="DRIVER_INFO" perm="ro">
  <defText name="NAME">Simulator</defText>
</defTextVector>
<defBLOBVector device="Telescope" name="UPLOAD" perm="wo">
  <defBLOB name="FILE"/>
</defBLOBVector>
"#;

    async fn accept_handshake(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; HANDSHAKE.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), HANDSHAKE);
        stream
    }

    /// Read until `terminator` has been received
    async fn read_until(stream: &mut TcpStream, terminator: &str) -> String {
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&received).contains(terminator) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending {terminator}");
            received.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(received).unwrap()
    }

    async fn poll_until(client: &mut Client, done: impl Fn(&Client) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done(client) {
                assert_eq!(client.poll().await.unwrap(), ReadStatus::Open);
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn has_property(client: &Client, device: &str, property: &str) -> bool {
        client.registry().find_property(device, property).is_ok()
    }

    fn drain(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_connect_sends_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { accept_handshake(&listener).await });

        let mut client = Client::new(ClientConfig::default());
        client.connect("127.0.0.1", port).await.unwrap();
        assert!(client.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_keeps_no_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = Client::new(ClientConfig::default());
        let err = client.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
        assert!(!client.is_connected());
        assert!(matches!(client.poll().await, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_session_until_agent_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut stream = accept_handshake(&listener).await;
            stream.write_all(DEF_EQ_COORD.as_bytes()).await.unwrap();
            stream.write_all(SET_EQ_COORD.as_bytes()).await.unwrap();
        });

        let mut client = Client::new(ClientConfig::default());
        let mut rx = client.subscribe();
        client.connect("127.0.0.1", port).await.unwrap();
        server.await.unwrap();

        timeout(Duration::from_secs(5), client.run())
            .await
            .expect("session did not end")
            .unwrap();
        assert!(!client.is_connected());

        let property = client
            .registry()
            .find_property("Telescope", "EQ_COORD")
            .unwrap();
        assert_eq!(property.element("RA").unwrap().value.as_number(), Some(12.5));
        assert_eq!(property.element("DEC").unwrap().value.as_number(), Some(-30.5));

        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&RegistryEvent::Disconnected {
                cause: "agent closed connection".to_string()
            })
        );

        // teardown is idempotent and emits nothing more
        assert!(!client.teardown());
        client.disconnect();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_bad_input_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx_received) = oneshot::channel();
        let server = tokio::spawn(async move {
            let mut stream = accept_handshake(&listener).await;
            stream
                .write_all(b"<setNumberVector device=\"Ghost\" name=\"X\"></setNumberVector>\n")
                .await
                .unwrap();
            stream.write_all(b"<oops></wrong>\n").await.unwrap();
            stream.write_all(DEF_EQ_COORD.as_bytes()).await.unwrap();
            let received = read_until(&mut stream, "</newNumberVector>").await;
            tx.send(received).unwrap();
            // hold the connection until the client hangs up
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let mut client = Client::new(ClientConfig::default());
        let mut events = client.subscribe();
        client.connect("127.0.0.1", port).await.unwrap();
        poll_until(&mut client, |c| has_property(c, "Telescope", "EQ_COORD")).await;

        assert!(client.is_connected());
        assert!(client.registry().find_device("Ghost").is_err());
        let errors = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::ProtocolError(_)))
            .count();
        assert_eq!(errors, 2);

        client
            .send_number("Telescope", "EQ_COORD", &[("RA", 1.5)])
            .await
            .unwrap();
        let received = timeout(Duration::from_secs(5), rx_received)
            .await
            .unwrap()
            .unwrap();
        assert!(received.contains("<newNumberVector device=\"Telescope\" name=\"EQ_COORD\">"));
        assert!(received.contains("<oneNumber name=\"RA\">1.5</oneNumber>"));

        let ra = client
            .registry()
            .find_property("Telescope", "EQ_COORD")
            .unwrap()
            .element("RA")
            .unwrap();
        match &ra.value {
            ElementValue::Number(number) => {
                assert_eq!(number.target, 1.5);
                assert_eq!(number.value, 0.0);
            }
            other => panic!("unexpected value {other:?}"),
        }

        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(
            drain(&mut events),
            vec![RegistryEvent::Disconnected {
                cause: "disconnected by client".to_string()
            }]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_commands_are_checked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx_received) = oneshot::channel();
        let server = tokio::spawn(async move {
            let mut stream = accept_handshake(&listener).await;
            stream.write_all(DEF_EQ_COORD.as_bytes()).await.unwrap();
            stream.write_all(DEF_EXTRAS.as_bytes()).await.unwrap();
            let received = read_until(&mut stream, "</newBLOBVector>").await;
            tx.send(received).unwrap();
        });

        let mut client = Client::new(ClientConfig::default());
        client.connect("127.0.0.1", port).await.unwrap();
        poll_until(&mut client, |c| has_property(c, "Telescope", "UPLOAD")).await;

        assert!(matches!(
            client.send_text("Telescope", "DRIVER_INFO", &[("NAME", "x")]).await,
            Err(ConnectionError::Rejected(_))
        ));
        assert!(matches!(
            client.send_number("Telescope", "CONNECTION", &[("CONNECT", 1.0)]).await,
            Err(ConnectionError::Rejected(_))
        ));
        assert!(matches!(
            client.send_number("Telescope", "EQ_COORD", &[("ALT", 1.0)]).await,
            Err(ConnectionError::Rejected(_))
        ));
        assert!(matches!(
            client.send_switch("Focuser", "CONNECTION", "CONNECT", SwitchState::On).await,
            Err(ConnectionError::Registry(_))
        ));
        assert!(matches!(
            client.finish_blob().await,
            Err(ConnectionError::Wire(WireError::BlobFrameNotOpen))
        ));

        client
            .send_switch("Telescope", "CONNECTION", "CONNECT", SwitchState::On)
            .await
            .unwrap();
        client
            .upload_blob("Telescope", "UPLOAD", "FILE", ".txt", b"hello world")
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(5), rx_received)
            .await
            .unwrap()
            .unwrap();
        assert!(received.contains("<oneSwitch name=\"CONNECT\">On</oneSwitch>"));
        assert!(!received.contains("DISCONNECT"));
        assert!(received.contains("<oneBLOB name=\"FILE\" size=\"11\" format=\".txt\">"));
        assert!(received.contains("aGVsbG8gd29ybGQ="));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_frame_write_abandons_frame() {
        let mut client = Client::new(ClientConfig::default());
        client
            .serializer
            .start_blob(&mut Vec::new(), "CCD", "UPLOAD", "2024-03-01T21:15:30")
            .unwrap();
        assert!(client.serializer.blob_frame_open());

        assert!(matches!(
            client.send_in_frame(b"  <oneBLOB").await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(!client.serializer.blob_frame_open());

        // other commands are no longer blocked by the dead frame
        let mut out = Vec::new();
        client
            .serializer
            .new_text_vector(&mut out, "CCD", "FILE", &[("PATH", "a")])
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_clears_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut first = accept_handshake(&listener).await;
            first.write_all(DEF_EQ_COORD.as_bytes()).await.unwrap();
            let second = accept_handshake(&listener).await;
            (first, second)
        });

        let mut client = Client::new(ClientConfig::default());
        client.connect("127.0.0.1", port).await.unwrap();
        poll_until(&mut client, |c| has_property(c, "Telescope", "EQ_COORD")).await;

        client.connect("127.0.0.1", port).await.unwrap();
        assert!(client.is_connected());
        assert!(client.registry().is_empty());
        server.await.unwrap();
    }
}
