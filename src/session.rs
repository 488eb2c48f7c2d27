//! Instrument session: one transport, one codec, one exclusion primitive.
//!
//! [`InstrumentSession`] owns the open transport inside a
//! `tokio::sync::Mutex`. Every byte written and every reply read, whether by a
//! foreground caller or by the feedback poller, happens while that mutex is
//! held. Command and reply pairs therefore never interleave on the wire.
//!
//! ## Flags
//!
//! - `connected`: set by `connect`, cleared first thing in `disconnect`
//! - `busy`: set between the write of an exclusive command and its reply
//! - feedback pause: a depth counter raised by exclusive commands *before*
//!   they wait for the lock, so the poller stops issuing new polls while a
//!   foreground command is queued
//!
//! ## Device faults
//!
//! A recognised fault token is a successful [`Reply::DeviceError`], never an
//! `Err`. Use [`Reply::into_value`] to turn it into a hard error.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = InstrumentSession::from_config(Arc::new(SerialConnector), config)?;
//! session.connect_configured().await?;
//! let level = session.query_default("DN", vec![]).await?;
//! session.query_default("RP", vec![Value::from(30)]).await?.into_value()?;
//! session.disconnect().await;
//! ```

use crate::codec::{Classification, Command, FrameCodec, Response, Value};
use crate::config::{ConnectionConfig, SessionConfig};
use crate::error::{Reply, SessionError, SessionResult, TransportError};
use crate::feedback::{FeedbackPoller, FeedbackSample};
use crate::transport::{Connector, Transport};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::instrument;

/// Budget for discarding stale input before a write.
const DRAIN_BUDGET: Duration = Duration::from_millis(5);

/// Capacity of the feedback broadcast channel.
const FEEDBACK_CHANNEL_CAPACITY: usize = 128;

type TransportSlot = Option<Box<dyn Transport>>;

/// State shared between the session handle and its feedback poller.
pub(crate) struct SessionCore {
    codec: Box<dyn FrameCodec>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    /// The exclusion primitive. `None` while disconnected.
    transport: Mutex<TransportSlot>,
    address: RwLock<Option<String>>,
    connected: AtomicBool,
    busy: AtomicBool,
    feedback_enabled: AtomicBool,
    pause_depth: AtomicUsize,
    feedback_tx: broadcast::Sender<FeedbackSample>,
    latest: RwLock<HashMap<String, FeedbackSample>>,
}

/// Raises the feedback pause depth for its lifetime.
struct PauseGuard<'a>(&'a AtomicUsize);

impl<'a> PauseGuard<'a> {
    fn engage(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        // Only guards touch the depth, so it never underflows and a guard
        // outliving a disconnect cannot cancel a pause raised after reconnect.
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds `busy` for its lifetime.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionCore {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn is_feedback_paused(&self) -> bool {
        self.pause_depth.load(Ordering::SeqCst) > 0
    }

    /// One status poll on behalf of the feedback poller.
    pub(crate) async fn poll(&self, code: &str) -> SessionResult<Reply> {
        self.query(code, Vec::new(), self.config.query.timeout, Duration::ZERO)
            .await
    }

    pub(crate) fn publish(&self, code: &str, reply: Reply) {
        let sample = FeedbackSample {
            code: code.to_string(),
            reply,
            at: chrono::Utc::now(),
        };
        self.latest.write().insert(code.to_string(), sample.clone());
        // No subscribers is fine; the cache still holds the value.
        let _ = self.feedback_tx.send(sample);
    }

    async fn acquire(&self) -> SessionResult<MutexGuard<'_, TransportSlot>> {
        let limit = self.config.query.acquire_timeout;
        tokio::time::timeout(limit, self.transport.lock())
            .await
            .map_err(|_| SessionError::Timeout {
                what: "exclusive transport access".to_string(),
                elapsed: limit,
            })
    }

    #[instrument(
        name = "query",
        level = "debug",
        skip(self, args),
        fields(classification = tracing::field::Empty)
    )]
    async fn query(
        &self,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
        settle_delay: Duration,
    ) -> SessionResult<Reply> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let command = self.codec.command(code, args)?;
        let classification = command.classification();
        tracing::Span::current().record("classification", tracing::field::display(classification));

        let pause = classification
            .is_exclusive()
            .then(|| PauseGuard::engage(&self.pause_depth));

        let mut slot = self.acquire().await?;

        // disconnect may have run while we were queued
        if !self.is_connected() {
            self.close_abandoned(&mut slot).await;
            return Err(SessionError::NotConnected);
        }
        let Some(transport) = slot.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        let busy = classification
            .is_exclusive()
            .then(|| BusyGuard::engage(&self.busy));

        let result = self
            .exchange(transport.as_mut(), &command, timeout, settle_delay)
            .await;

        drop(busy);
        if !self.is_connected() {
            self.close_abandoned(&mut slot).await;
        }
        drop(slot);
        drop(pause);

        if !settle_delay.is_zero() {
            tokio::time::sleep(settle_delay).await;
        }
        result
    }

    /// Write one command and wait for its reply, retrying once on a busy token.
    async fn exchange(
        &self,
        transport: &mut dyn Transport,
        command: &Command,
        timeout: Duration,
        settle_delay: Duration,
    ) -> SessionResult<Reply> {
        let frame = self.codec.encode(command.code(), command.args());
        let mut retried = false;

        loop {
            if self.config.query.drain_before_write {
                transport.drain(DRAIN_BUDGET).await;
            }

            transport.write(&frame).await?;
            tracing::trace!(frame = %String::from_utf8_lossy(&frame).escape_debug(), "Sent frame");

            let response = self
                .read_reply(transport, command.code(), command.classification(), timeout)
                .await?;

            let Some(token) = response.error_token else {
                return Ok(Reply::Value(response.payload));
            };
            let description = self
                .codec
                .describe_error(&token)
                .unwrap_or("unknown device fault");

            let retryable = self.codec.retry_tokens().contains(&token.as_str());
            if retryable && self.config.query.retry_on_busy && !retried {
                tracing::debug!(token = %token, "Device busy; repeating command once");
                retried = true;
                tokio::time::sleep(settle_delay).await;
                continue;
            }

            tracing::warn!(
                code = %command.code(),
                token = %token,
                description,
                "Device reported fault"
            );
            return Ok(Reply::device_error(token, description));
        }
    }

    /// Read lines until one completes `code`, the budget runs out, or the
    /// transport fails. Progress acknowledgements are skipped; other lines are
    /// collected for accumulating commands and discarded otherwise.
    async fn read_reply(
        &self,
        transport: &mut dyn Transport,
        code: &str,
        classification: Classification,
        timeout: Duration,
    ) -> SessionResult<Response> {
        let started = Instant::now();
        let read_slice = self.config.query.read_slice;
        let accumulates = self.codec.accumulates(code);
        let mut body: Vec<String> = Vec::new();

        loop {
            let budget = if classification.honours_timeout() {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(SessionError::Timeout {
                        what: format!("reply to {}", code),
                        elapsed: started.elapsed(),
                    });
                }
                read_slice.min(remaining)
            } else {
                read_slice
            };

            match transport.read_line(budget).await {
                Ok(line) => {
                    let mut response = self.codec.interpret(code, &line);
                    if response.matched {
                        if accumulates && response.error_token.is_none() {
                            response.payload = body.join("\n");
                        }
                        return Ok(response);
                    }
                    if self.codec.is_progress(&line) {
                        tracing::trace!(code, "Command acknowledged");
                    } else if accumulates && !response.payload.is_empty() {
                        body.push(response.payload);
                    } else {
                        tracing::trace!(
                            line = %String::from_utf8_lossy(&line).escape_debug(),
                            "Discarding unrelated line"
                        );
                    }
                }
                Err(TransportError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close a transport left behind by a `disconnect` that could not take the lock.
    async fn close_abandoned(&self, slot: &mut MutexGuard<'_, TransportSlot>) {
        if let Some(mut transport) = slot.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "Failed to close transport");
            }
            tracing::info!("Closed transport released after disconnect");
        }
    }
}

/// A command/response session with one instrument.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct InstrumentSession {
    core: Arc<SessionCore>,
    poller: Mutex<Option<FeedbackPoller>>,
}

impl InstrumentSession {
    /// Create a disconnected session.
    pub fn new(
        codec: Box<dyn FrameCodec>,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        let (feedback_tx, _) = broadcast::channel(FEEDBACK_CHANNEL_CAPACITY);
        Self {
            core: Arc::new(SessionCore {
                codec,
                connector,
                config,
                transport: Mutex::new(None),
                address: RwLock::new(None),
                connected: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                feedback_enabled: AtomicBool::new(false),
                pause_depth: AtomicUsize::new(0),
                feedback_tx,
                latest: RwLock::new(HashMap::new()),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Create a disconnected session with the codec named in `config`.
    pub fn from_config(connector: Arc<dyn Connector>, config: SessionConfig) -> SessionResult<Self> {
        let codec = config.codec.build()?;
        Ok(Self::new(codec, connector, config))
    }

    /// Open the transport to `address` and start feedback if codes are configured.
    ///
    /// On failure the session stays disconnected and usable.
    pub async fn connect(&self, address: &str, connection: &ConnectionConfig) -> SessionResult<()> {
        let feedback = &self.core.config.feedback;
        if !feedback.codes.is_empty() {
            self.check_feedback(&feedback.codes, feedback.interval)?;
        }

        {
            let mut slot = self.core.transport.lock().await;
            if self.core.is_connected() {
                tracing::debug!(address, "Already connected");
                return Ok(());
            }

            let transport = match self.core.connector.open(address, connection).await {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::warn!(address, error = %e, "Connection failed");
                    return Err(e);
                }
            };

            *slot = Some(transport);
            *self.core.address.write() = Some(address.to_string());
            self.core.busy.store(false, Ordering::SeqCst);
            self.core.connected.store(true, Ordering::SeqCst);
        }

        tracing::info!(
            address,
            codec = self.core.codec.family(),
            baud = connection.baud_rate,
            "Connected"
        );

        if !feedback.codes.is_empty() {
            if let Err(e) = self
                .start_feedback(feedback.codes.clone(), feedback.interval)
                .await
            {
                tracing::warn!(error = %e, "Feedback failed to start; closing connection");
                self.disconnect().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Connect using the address and connection settings from the configuration.
    pub async fn connect_configured(&self) -> SessionResult<()> {
        let config = &self.core.config;
        self.connect(&config.address, &config.connection).await
    }

    /// Stop feedback, close the transport and reset all flags. Idempotent.
    ///
    /// Never blocks longer than roughly twice `feedback.join_timeout`.
    pub async fn disconnect(&self) {
        let was_connected = self.core.connected.swap(false, Ordering::SeqCst);

        self.stop_feedback().await;

        let join_timeout = self.core.config.feedback.join_timeout;
        match tokio::time::timeout(join_timeout, self.core.transport.lock()).await {
            Ok(mut slot) => {
                if let Some(mut transport) = slot.take() {
                    if let Err(e) = transport.close().await {
                        tracing::warn!(error = %e, "Failed to close transport");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    ?join_timeout,
                    "Transport still held by an in-flight query; it will be closed on release"
                );
            }
        }

        self.core.busy.store(false, Ordering::SeqCst);
        self.core.feedback_enabled.store(false, Ordering::SeqCst);

        if was_connected {
            tracing::info!(address = ?self.address(), "Disconnected");
        }
    }

    /// Send `code` with `args` and wait for the matching reply.
    ///
    /// `timeout` bounds the wait for a reply (ignored for
    /// [`Classification::NoTimeout`] commands); `settle_delay` is slept after
    /// the transport is released.
    pub async fn query(
        &self,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
        settle_delay: Duration,
    ) -> SessionResult<Reply> {
        self.core.query(code, args, timeout, settle_delay).await
    }

    /// [`query`](Self::query) with the configured timeout and settle delay.
    pub async fn query_default(&self, code: &str, args: Vec<Value>) -> SessionResult<Reply> {
        let query = &self.core.config.query;
        self.core
            .query(code, args, query.timeout, query.settle_delay)
            .await
    }

    /// Start (or restart) background polling of status `codes`.
    pub async fn start_feedback(&self, codes: Vec<String>, interval: Duration) -> SessionResult<()> {
        if !self.core.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.check_feedback(&codes, interval)?;

        let mut slot = self.poller.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop(self.core.config.feedback.join_timeout).await;
        }

        tracing::info!(codes = ?codes, ?interval, "Starting feedback");
        *slot = Some(FeedbackPoller::spawn(self.core.clone(), codes, interval));
        self.core.feedback_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reject poll settings the codec cannot serve as status queries.
    fn check_feedback(&self, codes: &[String], interval: Duration) -> SessionResult<()> {
        if interval.is_zero() {
            return Err(SessionError::Config(
                "feedback interval must be > 0".to_string(),
            ));
        }
        for code in codes {
            self.core.codec.validate(code)?;
            if self.core.codec.classify(code) != Classification::StatusQuery {
                return Err(SessionError::InvalidCommand {
                    code: code.clone(),
                    reason: "feedback codes must be status queries".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stop background polling. No-op if it is not running.
    pub async fn stop_feedback(&self) {
        let mut slot = self.poller.lock().await;
        if let Some(poller) = slot.take() {
            poller.stop(self.core.config.feedback.join_timeout).await;
        }
        self.core.feedback_enabled.store(false, Ordering::SeqCst);
    }

    /// Receive every feedback sample published from now on.
    pub fn subscribe_feedback(&self) -> broadcast::Receiver<FeedbackSample> {
        self.core.feedback_tx.subscribe()
    }

    /// Most recent feedback sample for `code`.
    pub fn latest_feedback(&self, code: &str) -> Option<FeedbackSample> {
        self.core.latest.read().get(code).cloned()
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Whether an exclusive command is between write and reply.
    pub fn is_busy(&self) -> bool {
        self.core.is_busy()
    }

    /// Whether the feedback poller is running.
    pub fn is_feedback_enabled(&self) -> bool {
        self.core.feedback_enabled.load(Ordering::SeqCst)
    }

    /// Whether a foreground command currently suspends polling.
    pub fn is_feedback_paused(&self) -> bool {
        self.core.is_feedback_paused()
    }

    /// Address of the last successful connection.
    pub fn address(&self) -> Option<String> {
        self.core.address.read().clone()
    }

    /// Effective configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// Wire format in use.
    pub fn codec(&self) -> &dyn FrameCodec {
        self.core.codec.as_ref()
    }
}

impl std::fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("address", &self.address())
            .field("codec", &self.core.codec.family())
            .field("connected", &self.is_connected())
            .field("busy", &self.is_busy())
            .field("feedback_enabled", &self.is_feedback_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AddressFramedCodec;
    use crate::config::DeviceProfile;
    use crate::sim::{DuplexConnector, SimFault, SimulatedPump};

    fn session_with(pump: &SimulatedPump, feedback: bool) -> InstrumentSession {
        let mut config = DeviceProfile::Pump.defaults();
        config.address = "sim://pump".to_string();
        if !feedback {
            config.feedback.codes.clear();
        }
        InstrumentSession::new(
            Box::new(AddressFramedCodec::new(1).unwrap()),
            Arc::new(DuplexConnector::new(pump.clone())),
            config,
        )
    }

    #[tokio::test]
    async fn query_before_connect_fails_fast() {
        let pump = SimulatedPump::new(1);
        let session = session_with(&pump, false);

        let result = session.query_default("DS", vec![]).await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert!(pump.transcript().is_empty());
    }

    #[tokio::test]
    async fn actuation_returns_ack_and_clears_flags() {
        let pump = SimulatedPump::new(1);
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let reply = session
            .query("RI", vec![Value::from(100)], Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(reply, Reply::Value("ok".to_string()));
        assert!(!session.is_busy());
        assert!(!session.is_feedback_paused());
        assert_eq!(pump.frames(), vec!["1RI100º\r".to_string()]);
    }

    #[tokio::test]
    async fn status_query_returns_payload() {
        let pump = SimulatedPump::new(1);
        pump.set_level(276);
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let reply = session.query_default("DN", vec![]).await.unwrap();
        assert_eq!(reply.value(), Some("276"));
    }

    #[tokio::test]
    async fn invalid_code_is_rejected_before_writing() {
        let pump = SimulatedPump::new(1);
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let result = session.query_default("TOOLONG", vec![]).await;
        assert!(matches!(result, Err(SessionError::InvalidCommand { .. })));
        assert!(pump.transcript().is_empty());
    }

    #[tokio::test]
    async fn busy_token_is_retried_once() {
        let pump = SimulatedPump::new(1);
        pump.push_fault("RP", SimFault::Token("er4"));
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let reply = session
            .query("RP", vec![Value::from(30)], Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(reply.value(), Some("ok"));
        assert_eq!(pump.frames().len(), 2);
    }

    #[tokio::test]
    async fn persistent_busy_token_is_surfaced() {
        let pump = SimulatedPump::new(1);
        pump.push_fault("RP", SimFault::Token("er4"));
        pump.push_fault("RP", SimFault::Token("er4"));
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let reply = session
            .query("RP", vec![Value::from(30)], Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap();

        match reply {
            Reply::DeviceError(fault) => assert_eq!(fault.token, "er4"),
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn connection_failure_leaves_session_disconnected() {
        let pump = SimulatedPump::new(1);
        let connector = DuplexConnector::new(pump.clone());
        connector.refuse_connections(true);
        let mut config = DeviceProfile::Pump.defaults();
        config.address = "sim://pump".to_string();
        let session = InstrumentSession::from_config(Arc::new(connector), config).unwrap();

        let result = session.connect_configured().await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
        assert!(!session.is_connected());
        assert!(!session.is_feedback_enabled());
    }

    #[tokio::test]
    async fn connect_starts_configured_feedback() {
        let pump = SimulatedPump::new(1);
        let session = session_with(&pump, true);
        session.connect_configured().await.unwrap();

        assert!(session.is_feedback_enabled());
        assert_eq!(session.address().as_deref(), Some("sim://pump"));

        session.disconnect().await;
        assert!(!session.is_feedback_enabled());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn feedback_rejects_actuation_codes() {
        let pump = SimulatedPump::new(1);
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let result = session
            .start_feedback(vec!["RI".to_string()], Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SessionError::InvalidCommand { .. })));
        assert!(!session.is_feedback_enabled());
    }

    #[tokio::test]
    async fn connect_with_bad_feedback_codes_leaves_session_disconnected() {
        let pump = SimulatedPump::new(1);
        let connector = Arc::new(DuplexConnector::new(pump.clone()));
        let mut config = DeviceProfile::Pump.defaults();
        config.address = "sim://pump".to_string();
        config.feedback.codes = vec!["RI".to_string()];
        let session = InstrumentSession::new(
            Box::new(AddressFramedCodec::new(1).unwrap()),
            connector.clone(),
            config,
        );

        let result = session.connect_configured().await;
        assert!(matches!(result, Err(SessionError::InvalidCommand { .. })));
        assert!(!session.is_connected());
        assert!(!session.is_feedback_enabled());
        assert_eq!(connector.open_count(), 0);
        assert!(session.core.transport.lock().await.is_none());
    }

    #[tokio::test]
    async fn pause_held_across_reconnect_does_not_cancel_a_new_pause() {
        let pump = SimulatedPump::new(1);
        let session = session_with(&pump, false);
        session.connect_configured().await.unwrap();

        let stale = PauseGuard::engage(&session.core.pause_depth);
        session.disconnect().await;
        session.connect_configured().await.unwrap();

        let current = PauseGuard::engage(&session.core.pause_depth);
        drop(stale);
        assert!(session.is_feedback_paused());
        drop(current);
        assert!(!session.is_feedback_paused());

        session.disconnect().await;
    }
}
