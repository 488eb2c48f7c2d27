//! In-process simulated instruments.
//!
//! Simulated devices speak the real wire formats over `tokio::io::duplex`
//! pipes, so a session driven against them exercises the same codec and
//! transport code as real hardware. They back the integration tests and the
//! CLI's `--simulate` mode.
//!
//! - [`SimulatedPump`]: address-framed pump with injectable faults and a
//!   transcript of every received frame
//! - [`SimulatedDma`]: template-framed DMA instrument
//! - [`DuplexConnector`]: a [`Connector`] that wires a fresh pipe to a
//!   simulated device on every `open`
//! - [`RecordingTransport`]: wraps a transport and logs writes and reads in
//!   order, for asserting that command/reply pairs never interleave

use crate::config::ConnectionConfig;
use crate::error::{SessionError, SessionResult, TransportError};
use crate::transport::{Connector, StreamTransport, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Size of the in-memory pipe between session and device.
const PIPE_CAPACITY: usize = 4096;

/// A device that can serve one end of a duplex pipe.
pub trait SimulatedDevice: Send + Sync + 'static {
    /// Answer frames arriving on `stream` until it closes.
    fn serve(&self, stream: DuplexStream) -> JoinHandle<()>;
}

/// One frame as received by a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    /// Raw frame text, terminator included
    pub frame: String,
    /// Arrival time
    pub at: Instant,
}

/// A scripted misbehaviour for the next matching command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Answer with this fault token instead of the normal reply
    Token(&'static str),
    /// Do not answer at all
    Silence,
}

// =============================================================================
// SimulatedPump
// =============================================================================

#[derive(Debug)]
struct PumpState {
    position: i64,
    level: i64,
    status: u8,
    silent: bool,
    response_delay: Duration,
    faults: HashMap<String, VecDeque<SimFault>>,
}

#[derive(Debug)]
struct PumpInner {
    channel: u8,
    terminator: u8,
    state: Mutex<PumpState>,
    transcript: Mutex<Vec<TranscriptEntry>>,
}

/// Address-framed pipette pump.
///
/// Clones share state, so a test can keep a handle to script faults and read
/// the transcript while the session talks to the device.
#[derive(Debug, Clone)]
pub struct SimulatedPump {
    inner: Arc<PumpInner>,
}

impl SimulatedPump {
    /// Pump answering on `channel`, terminating replies with `\r`.
    pub fn new(channel: u8) -> Self {
        Self::with_terminator(channel, b'\r')
    }

    /// Pump answering on `channel` with a custom reply terminator.
    pub fn with_terminator(channel: u8, terminator: u8) -> Self {
        Self {
            inner: Arc::new(PumpInner {
                channel,
                terminator,
                state: Mutex::new(PumpState {
                    position: 0,
                    level: 0,
                    status: 0,
                    silent: false,
                    response_delay: Duration::ZERO,
                    faults: HashMap::new(),
                }),
                transcript: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Delay before every reply.
    pub fn set_response_delay(&self, delay: Duration) {
        self.inner.state.lock().response_delay = delay;
    }

    /// Liquid level reported by `DN`.
    pub fn set_level(&self, level: i64) {
        self.inner.state.lock().level = level;
    }

    /// Status byte reported by `DS`.
    pub fn set_status(&self, status: u8) {
        self.inner.state.lock().status = status;
    }

    /// Position reported by `DP`.
    pub fn position(&self) -> i64 {
        self.inner.state.lock().position
    }

    /// Stop answering anything until cleared.
    pub fn set_silent(&self, silent: bool) {
        self.inner.state.lock().silent = silent;
    }

    /// Queue a one-shot fault for the next `code` command.
    pub fn push_fault(&self, code: &str, fault: SimFault) {
        self.inner
            .state
            .lock()
            .faults
            .entry(code.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Every frame received so far.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.transcript.lock().clone()
    }

    /// Raw text of every frame received so far.
    pub fn frames(&self) -> Vec<String> {
        self.inner
            .transcript
            .lock()
            .iter()
            .map(|e| e.frame.clone())
            .collect()
    }

    fn respond(&self, frame: &str) -> (Option<String>, Duration) {
        let mut state = self.inner.state.lock();
        let delay = state.response_delay;

        let body = frame.trim_end_matches(['\r', '\n']).trim_end_matches('º');
        let mut chars = body.chars();
        let addressed = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .map(|d| d == u32::from(self.inner.channel))
            .unwrap_or(false);
        if !addressed {
            return (None, delay);
        }

        let rest = chars.as_str();
        if rest.len() < 2 || !rest.is_char_boundary(2) {
            return (Some(self.frame_reply("er1")), delay);
        }
        let (code, args) = rest.split_at(2);

        if let Some(fault) = state.faults.get_mut(code).and_then(VecDeque::pop_front) {
            return match fault {
                SimFault::Token(token) => (Some(self.frame_reply(token)), delay),
                SimFault::Silence => (None, delay),
            };
        }
        if state.silent {
            return (None, delay);
        }

        let steps = args.parse::<i64>().unwrap_or(0);
        let body = match code {
            "DS" => format!("ds{}", state.status),
            "DE" => "de0".to_string(),
            "DP" => format!("dp{}", state.position),
            "DN" => format!("dn{}", state.level),
            "DV" => "dv1.0".to_string(),
            "DM" => "dm1".to_string(),
            "DX" | "DI" | "DO" | "DR" => format!("{}0", code.to_ascii_lowercase()),
            "RI" => {
                state.position += steps;
                "ok".to_string()
            }
            "RO" => {
                state.position -= steps;
                "ok".to_string()
            }
            "RZ" => {
                state.position = 0;
                "ok".to_string()
            }
            _ => "ok".to_string(),
        };
        (Some(self.frame_reply(&body)), delay)
    }

    fn frame_reply(&self, body: &str) -> String {
        format!(
            "{}{}º{}",
            self.inner.channel,
            body,
            char::from(self.inner.terminator)
        )
    }

    fn record(&self, frame: &str) {
        self.inner.transcript.lock().push(TranscriptEntry {
            frame: frame.to_string(),
            at: Instant::now(),
        });
    }
}

impl SimulatedDevice for SimulatedPump {
    fn serve(&self, stream: DuplexStream) -> JoinHandle<()> {
        let pump = self.clone();
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut reader = BufReader::new(read);
            let mut buf = Vec::new();

            loop {
                buf.clear();
                match reader.read_until(b'\r', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }

                let frame = String::from_utf8_lossy(&buf).into_owned();
                pump.record(&frame);

                let (reply, delay) = pump.respond(&frame);
                let Some(reply) = reply else { continue };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        })
    }
}

// =============================================================================
// SimulatedDma
// =============================================================================

#[derive(Debug)]
struct DmaInner {
    channel: u8,
    run_duration: Mutex<Duration>,
    data: Mutex<Vec<String>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
}

/// Template-framed DMA instrument.
#[derive(Debug, Clone)]
pub struct SimulatedDma {
    inner: Arc<DmaInner>,
}

impl SimulatedDma {
    /// Instrument with serial-number slot `channel`.
    pub fn new(channel: u8) -> Self {
        Self {
            inner: Arc::new(DmaInner {
                channel,
                run_duration: Mutex::new(Duration::from_millis(50)),
                data: Mutex::new(vec![
                    "Frequency (Hz), E' (Pa), E'' (Pa)".to_string(),
                    "1.0, 2.0, 3.0".to_string(),
                ]),
                transcript: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Time between the `OKR` and `OKC` of a `RUN`.
    pub fn set_run_duration(&self, duration: Duration) {
        *self.inner.run_duration.lock() = duration;
    }

    /// Lines streamed by `GET`.
    pub fn set_data(&self, lines: &[&str]) {
        *self.inner.data.lock() = lines.iter().map(|l| l.to_string()).collect();
    }

    /// Raw text of every frame received so far.
    pub fn frames(&self) -> Vec<String> {
        self.inner
            .transcript
            .lock()
            .iter()
            .map(|e| e.frame.clone())
            .collect()
    }

    /// Lines to send for `frame`, each preceded by its delay.
    fn respond(&self, frame: &str) -> Vec<(Duration, String)> {
        let fields: Vec<&str> = frame.split(',').collect();
        let slot = format!("SN{}", self.inner.channel);
        if fields.len() < 4 || fields[0] != "DMA" || fields[1] != slot {
            return Vec::new();
        }

        let received = (Duration::ZERO, "OKR".to_string());
        match fields[2] {
            "INIT" | "CLR" | "CLAMP" => vec![received, (Duration::ZERO, "OKC".to_string())],
            "RUN" => vec![received, (*self.inner.run_duration.lock(), "OKC".to_string())],
            "GET" => {
                let mut lines = vec![received];
                lines.extend(self.inner.data.lock().iter().map(|l| (Duration::ZERO, l.clone())));
                lines.push((Duration::ZERO, "OKC".to_string()));
                lines
            }
            _ => vec![(Duration::ZERO, "er1".to_string())],
        }
    }
}

impl SimulatedDevice for SimulatedDma {
    fn serve(&self, stream: DuplexStream) -> JoinHandle<()> {
        let dma = self.clone();
        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(stream);
            let mut pending: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 256];

            loop {
                let n = match read.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&chunk[..n]);

                while let Some(end) = find_frame_end(&pending) {
                    let raw: Vec<u8> = pending.drain(..end).collect();
                    let frame = String::from_utf8_lossy(&raw).into_owned();
                    dma.inner.transcript.lock().push(TranscriptEntry {
                        frame: frame.clone(),
                        at: Instant::now(),
                    });

                    for (delay, line) in dma.respond(&frame) {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if write.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Index one past the `,END` closing the first complete frame.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    const MARKER: &[u8] = b",END";
    buf.windows(MARKER.len())
        .position(|w| w == MARKER)
        .map(|pos| pos + MARKER.len())
}

// =============================================================================
// Recording transport
// =============================================================================

/// Direction of a recorded transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A frame write started
    Write,
    /// A complete line was read
    Read,
}

/// One recorded transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Write or read
    pub kind: TransportEventKind,
    /// Bytes written or line read, lossily decoded
    pub data: String,
    /// When it happened
    pub at: Instant,
}

/// Shared, ordered log of transport events.
pub type TransportLog = Arc<Mutex<Vec<TransportEvent>>>;

/// Transport wrapper that appends every write and completed read to a log.
pub struct RecordingTransport<T> {
    inner: T,
    log: TransportLog,
}

impl<T: Transport> RecordingTransport<T> {
    /// Wrap `inner`, recording into `log`.
    pub fn new(inner: T, log: TransportLog) -> Self {
        Self { inner, log }
    }

    fn push(&self, kind: TransportEventKind, bytes: &[u8]) {
        self.log.lock().push(TransportEvent {
            kind,
            data: String::from_utf8_lossy(bytes).into_owned(),
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl<T: Transport> Transport for RecordingTransport<T> {
    async fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.push(TransportEventKind::Write, frame);
        self.inner.write(frame).await
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let line = self.inner.read_line(timeout).await?;
        self.push(TransportEventKind::Read, &line);
        Ok(line)
    }

    async fn drain(&mut self, timeout: Duration) -> usize {
        self.inner.drain(timeout).await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.inner.close().await
    }
}

// =============================================================================
// DuplexConnector
// =============================================================================

/// Connector that serves every `open` from a simulated device.
pub struct DuplexConnector {
    device: Arc<dyn SimulatedDevice>,
    recorder: Option<TransportLog>,
    refuse: AtomicBool,
    opened: AtomicUsize,
}

impl DuplexConnector {
    /// Connector backed by `device`.
    pub fn new(device: impl SimulatedDevice) -> Self {
        Self {
            device: Arc::new(device),
            recorder: None,
            refuse: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        }
    }

    /// Record all transport traffic into `log`.
    pub fn with_recorder(mut self, log: TransportLog) -> Self {
        self.recorder = Some(log);
        self
    }

    /// Make subsequent `open` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn open(
        &self,
        address: &str,
        config: &ConnectionConfig,
    ) -> SessionResult<Box<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Connection {
                address: address.to_string(),
                message: "simulated device refused the connection".to_string(),
            });
        }

        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        // The device task ends when the host side is dropped.
        drop(self.device.serve(device));

        let transport = StreamTransport::new(host, config.delimiter_byte());
        self.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(address, "Opened simulated transport");

        match &self.recorder {
            Some(log) => Ok(Box::new(RecordingTransport::new(transport, log.clone()))),
            None => Ok(Box::new(transport)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_answers_queries_and_actuations() {
        let pump = SimulatedPump::new(1);
        pump.set_level(42);
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        pump.serve(device);
        let mut transport = StreamTransport::new(host, b'\r');

        transport.write("1DNº\r".as_bytes()).await.unwrap();
        let line = transport.read_line(Duration::from_millis(200)).await.unwrap();
        assert_eq!(line, "1dn42º".as_bytes());

        transport.write("1RI25º\r".as_bytes()).await.unwrap();
        let line = transport.read_line(Duration::from_millis(200)).await.unwrap();
        assert_eq!(line, "1okº".as_bytes());
        assert_eq!(pump.position(), 25);
    }

    #[tokio::test]
    async fn pump_ignores_other_channels() {
        let pump = SimulatedPump::new(1);
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        pump.serve(device);
        let mut transport = StreamTransport::new(host, b'\r');

        transport.write("2DSº\r".as_bytes()).await.unwrap();
        let result = transport.read_line(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(pump.frames(), vec!["2DSº\r".to_string()]);
    }

    #[tokio::test]
    async fn dma_splits_frames_on_end_marker() {
        let dma = SimulatedDma::new(1);
        dma.set_run_duration(Duration::ZERO);
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        dma.serve(device);
        let mut transport = StreamTransport::new(host, b'\n');

        transport.write(b"DMA,SN1,INIT,3,END").await.unwrap();
        assert_eq!(transport.read_line(Duration::from_millis(200)).await.unwrap(), b"OKR");
        assert_eq!(transport.read_line(Duration::from_millis(200)).await.unwrap(), b"OKC");

        dma.set_data(&["1.0, 2.0"]);
        transport.write(b"DMA,SN1,GET,END").await.unwrap();
        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(transport.read_line(Duration::from_millis(200)).await.unwrap());
        }
        assert_eq!(lines, vec![b"OKR".to_vec(), b"1.0, 2.0".to_vec(), b"OKC".to_vec()]);
        assert_eq!(dma.frames().len(), 2);
    }

    #[test]
    fn frame_end_is_found_after_marker() {
        assert_eq!(find_frame_end(b"DMA,SN1,CLR,0,END"), Some(17));
        assert_eq!(find_frame_end(b"DMA,SN1,CLR,0,EN"), None);
    }

    #[tokio::test]
    async fn connector_records_traffic_and_refuses_on_request() {
        let log = TransportLog::default();
        let connector = DuplexConnector::new(SimulatedPump::new(1)).with_recorder(log.clone());
        let config = ConnectionConfig {
            line_delimiter: '\r',
            ..ConnectionConfig::default()
        };

        let mut transport = connector.open("sim", &config).await.unwrap();
        transport.write("1DSº\r".as_bytes()).await.unwrap();
        transport.read_line(Duration::from_millis(200)).await.unwrap();

        let kinds: Vec<_> = log.lock().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TransportEventKind::Write, TransportEventKind::Read]);
        assert_eq!(connector.open_count(), 1);

        connector.refuse_connections(true);
        assert!(matches!(
            connector.open("sim", &config).await,
            Err(SessionError::Connection { .. })
        ));
    }
}
