//! Transport abstractions for instrument sessions.
//!
//! A transport is a line-oriented byte pipe: it writes frames and hands back
//! one delimited line at a time. It carries no protocol knowledge; framing and
//! reply matching belong to the [`FrameCodec`](crate::codec::FrameCodec).
//!
//! # Types
//!
//! - [`Transport`]: the contract the session drives (write / read_line / drain / close)
//! - [`Connector`]: opens a [`Transport`] for an address
//! - [`StreamTransport`]: line framing over any `AsyncRead + AsyncWrite` stream
//! - [`SerialConnector`]: RS-232 / USB-serial ports through `tokio-serial`
//! - [`TcpConnector`]: socket-attached instruments (`host:port`)
//!
//! # Example
//!
//! ```rust,ignore
//! use instrument_session::transport::{Connector, SerialConnector};
//!
//! let mut transport = SerialConnector.open("/dev/ttyUSB0", &connection).await?;
//! transport.write(b"1DS\xc2\xba\r").await?;
//! let line = transport.read_line(Duration::from_millis(100)).await?;
//! ```

use crate::config::ConnectionConfig;
use crate::error::{SessionError, SessionResult, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

// =============================================================================
// Stream Trait
// =============================================================================

/// Trait alias for async byte streams usable as a transport.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` qualifies:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::net::TcpStream` (socket-attached instruments)
/// - `tokio::io::DuplexStream` (testing and simulation)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

// =============================================================================
// Transport / Connector
// =============================================================================

/// Line-oriented byte channel to one device.
#[async_trait]
pub trait Transport: Send {
    /// Write a complete frame and flush it.
    async fn write(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Read one line, delimiter excluded.
    ///
    /// Bytes of an incomplete line are kept when the read times out and are
    /// returned by the next call once the line completes.
    async fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Discard any stale input. Returns the number of bytes dropped.
    async fn drain(&mut self, timeout: Duration) -> usize;

    /// Close the underlying stream.
    async fn close(&mut self) -> std::io::Result<()>;
}

/// Opens transports for a device address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `address`.
    async fn open(
        &self,
        address: &str,
        config: &ConnectionConfig,
    ) -> SessionResult<Box<dyn Transport>>;
}

// =============================================================================
// StreamTransport
// =============================================================================

/// Line framing over an async byte stream.
pub struct StreamTransport<T> {
    reader: BufReader<T>,
    delimiter: u8,
    pending: Vec<u8>,
}

impl<T: SerialPortIO> StreamTransport<T> {
    /// Wrap `stream`, splitting input on `delimiter`.
    pub fn new(stream: T, delimiter: u8) -> Self {
        Self {
            reader: BufReader::new(stream),
            delimiter,
            pending: Vec::with_capacity(64),
        }
    }

    /// The line delimiter in use.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

#[async_trait]
impl<T: SerialPortIO> Transport for StreamTransport<T> {
    async fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let writer = self.reader.get_mut();
        writer.write_all(frame).await?;
        writer.flush().await
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let delimiter = self.delimiter;
        let read = tokio::time::timeout(
            timeout,
            self.reader.read_until(delimiter, &mut self.pending),
        )
        .await;

        match read {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok(0)) if self.pending.is_empty() => Err(TransportError::Closed),
            Ok(Ok(_)) => {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&delimiter) {
                    line.pop();
                }
                Ok(line)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            Ok(Err(e)) => Err(TransportError::Io(e)),
        }
    }

    async fn drain(&mut self, timeout: Duration) -> usize {
        let mut total_discarded = std::mem::take(&mut self.pending).len();

        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        total_discarded += buffered;

        let mut discard = [0u8; 256];
        let deadline = tokio::time::Instant::now() + timeout;
        let port = self.reader.get_mut();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, port.read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total_discarded += n,
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }

        if total_discarded > 0 {
            tracing::debug!(bytes = total_discarded, "Discarded stale transport input");
        }
        total_discarded
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        self.reader.get_mut().shutdown().await
    }
}

// =============================================================================
// Connectors
// =============================================================================

/// Opens serial ports through `tokio-serial` (8N1, no flow control).
#[cfg(feature = "instrument_serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(
        &self,
        address: &str,
        config: &ConnectionConfig,
    ) -> SessionResult<Box<dyn Transport>> {
        let port = open_serial_async(address, config.baud_rate, config.timeout).await?;
        tracing::info!(port = address, baud = config.baud_rate, "Opened serial port");
        Ok(Box::new(StreamTransport::new(port, config.delimiter_byte())))
    }
}

/// Open a serial port on a blocking thread so the runtime is never stalled.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    timeout: Duration,
) -> SessionResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let opened = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout)
            .open_native_async()
    })
    .await
    .map_err(|e| SessionError::Connection {
        address: port_path.to_string(),
        message: format!("serial open task failed: {}", e),
    })?;

    opened.map_err(|e| SessionError::Connection {
        address: port_path.to_string(),
        message: e.to_string(),
    })
}

/// Opens TCP connections to socket-attached instruments.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(
        &self,
        address: &str,
        config: &ConnectionConfig,
    ) -> SessionResult<Box<dyn Transport>> {
        let connect = tokio::net::TcpStream::connect(address);
        let stream = match tokio::time::timeout(config.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SessionError::Connection {
                    address: address.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SessionError::Connection {
                    address: address.to_string(),
                    message: format!("connect timed out after {:?}", config.timeout),
                })
            }
        };
        stream.set_nodelay(true)?;
        tracing::info!(address, "Opened socket transport");
        Ok(Box::new(StreamTransport::new(stream, config.delimiter_byte())))
    }
}
