//! Socket plus parser state for one live server connection

use indilink_core::{ParseError, StreamParser, WireError, XmlElement};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, trace};

/// Bytes taken from the socket per readiness event
pub const READ_CHUNK: usize = 31;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{host} did not resolve to any address")]
    NoAddress { host: String },
    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Registry(#[from] indilink_core::RegistryError),
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Result of one bounded read
#[derive(Debug)]
pub enum ReadOutcome {
    /// Elements completed by the bytes just read, possibly none
    Elements(Vec<Result<XmlElement, ParseError>>),
    /// Readiness was spurious
    WouldBlock,
    /// The peer closed its end
    Closed,
}

/// A connected stream and the parser fed from it.
///
/// Dropping the session closes the socket and discards partial input.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    parser: StreamParser,
}

impl Session {
    /// Resolve `host`, connect to the first address that accepts, and write
    /// the handshake bytes.
    pub async fn open(
        host: &str,
        port: u16,
        handshake: &[u8],
        max_element_len: usize,
    ) -> Result<Self, ConnectionError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| ConnectionError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    connected = Some((stream, addr));
                    break;
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let (mut stream, peer) = match (connected, last_error) {
            (Some(found), _) => found,
            (None, Some(source)) => {
                return Err(ConnectionError::Connect {
                    host: host.to_string(),
                    port,
                    source,
                })
            }
            (None, None) => {
                return Err(ConnectionError::NoAddress {
                    host: host.to_string(),
                })
            }
        };

        stream
            .write_all(handshake)
            .await
            .map_err(ConnectionError::Handshake)?;
        stream.flush().await.map_err(ConnectionError::Handshake)?;

        Ok(Self {
            stream,
            peer,
            parser: StreamParser::with_max_element_len(max_element_len),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait until the socket reports read readiness
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Read at most [`READ_CHUNK`] bytes without blocking and feed them to
    /// the parser
    pub fn read_elements(&mut self) -> io::Result<ReadOutcome> {
        let mut buf = [0u8; READ_CHUNK];
        match self.stream.try_read(&mut buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                trace!(peer = %self.peer, bytes = n, "Read");
                Ok(ReadOutcome::Elements(self.parser.feed(&buf[..n])))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Write one serialized command
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}
