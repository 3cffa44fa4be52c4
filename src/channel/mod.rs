//! Reconnecting delivery channel to the intake backend.
//!
//! The channel owns exactly one logical session. It is driven from a single
//! task: [`DeliveryChannel::next_event`] advances connection establishment,
//! reconnect timers and end-of-session detection, while
//! [`DeliveryChannel::send`] and [`DeliveryChannel::flush`] write frames.
//!
//! # State machine
//!
//! ```text
//!               connect_async()            handshake ok
//! Disconnected ───────────────► Connecting ─────────────► Connected
//!      ▲  ▲                         │                         │
//!      │  └──── retry timer ────────┤ I/O error, timeout,     │ I/O error,
//!      │        (backoff)           │ token rejected          │ EOF
//!      └────────────────────────────┴─────────────────────────┘
//! ```
//!
//! Retries never give up. Frames that could not be written stay in the write
//! buffer and are replayed, from their first byte, after the next handshake.
//! The write buffer is capped; a frame that cannot fit at all, or that no
//! longer fits after the cap shrank on refresh, is dropped and counted in
//! [`ChannelStats`].

pub mod backoff;
pub mod connector;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep_until, timeout};

use crate::config::{ChannelOptions, PipelineConfig};
use crate::error::SendError;
use crate::metrics;
use crate::wire::{self, AuthAckFrame, Frame, FrameKind};

pub use backoff::Backoff;
pub use connector::{BoxedTransport, Connector, TcpConnector, TlsConnector, Transport};

/// Connection state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No session; a retry may be scheduled.
    Disconnected,
    /// Transport or handshake in progress.
    Connecting,
    /// Handshake completed; frames can be sent.
    Connected,
}

impl ChannelState {
    fn gauge(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }
}

/// Why a session ended or could not be established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport could not be opened.
    ConnectFailed(String),
    /// A connect, handshake or write step ran out of time.
    Timeout(&'static str),
    /// The backend refused the token.
    TokenRejected(String),
    /// Reading or writing the session failed.
    Io(String),
    /// The backend closed the session.
    Closed,
    /// The backend sent something unintelligible.
    Protocol(String),
}

impl DisconnectReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::Timeout(_) => "timeout",
            Self::TokenRejected(_) => "token_rejected",
            Self::Io(_) => "io",
            Self::Closed => "closed",
            Self::Protocol(_) => "protocol",
        }
    }

    fn from_io(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::InvalidData {
            Self::Protocol(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            Self::Timeout(step) => write!(f, "{step} timed out"),
            Self::TokenRejected(reason) => write!(f, "token rejected: {reason}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Closed => f.write_str("closed by backend"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

/// Receives connection lifecycle transitions.
///
/// Callbacks run synchronously on the task driving the channel.
pub trait ChannelObserver: Send {
    /// The handshake completed.
    fn on_connected(&mut self);

    /// A session ended or an attempt failed.
    fn on_disconnected(&mut self, reason: &DisconnectReason);
}

/// A lifecycle transition returned by [`DeliveryChannel::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel became connected.
    Connected,
    /// The channel became disconnected.
    Disconnected(DisconnectReason),
}

impl ChannelEvent {
    /// Forwards the event to `observer`.
    pub fn dispatch(&self, observer: &mut dyn ChannelObserver) {
        match self {
            Self::Connected => observer.on_connected(),
            Self::Disconnected(reason) => observer.on_disconnected(reason),
        }
    }
}

/// Counters kept by the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Completed handshakes.
    pub connects: u64,
    /// Failed attempts and lost sessions.
    pub disconnects: u64,
    /// Frames dropped because they could not fit the write buffer.
    pub dropped_frames: u64,
    /// Bytes of those frames.
    pub dropped_bytes: u64,
}

struct Session {
    reader: ReadHalf<BoxedTransport>,
    writer: WriteHalf<BoxedTransport>,
}

enum Link {
    Idle { retry_at: Option<Instant> },
    Connecting(BoxFuture<'static, Result<Session, DisconnectReason>>),
    Connected(Session),
}

/// The single outbound session to the intake backend.
pub struct DeliveryChannel {
    connector: Arc<dyn Connector>,
    config_rx: watch::Receiver<Arc<PipelineConfig>>,
    current: Arc<PipelineConfig>,
    options: ChannelOptions,
    agent_id: String,
    hostname: String,
    link: Link,
    failures: u32,
    outbox: VecDeque<Frame>,
    buffered: usize,
    events: VecDeque<ChannelEvent>,
    observers: Vec<Box<dyn ChannelObserver>>,
    stats: ChannelStats,
    refresh_hint: Option<Arc<Notify>>,
}

impl fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("endpoint", &self.current.endpoint)
            .field("state", &self.state())
            .field("buffered", &self.buffered)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl DeliveryChannel {
    /// Creates a disconnected channel.
    ///
    /// The latest value of `config_rx` is read on every connection attempt.
    pub fn new(
        connector: Arc<dyn Connector>,
        config_rx: watch::Receiver<Arc<PipelineConfig>>,
        options: ChannelOptions,
        agent_id: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        let current = Arc::clone(&config_rx.borrow());
        Self {
            connector,
            config_rx,
            current,
            options,
            agent_id: agent_id.into(),
            hostname: hostname.into(),
            link: Link::Idle { retry_at: None },
            failures: 0,
            outbox: VecDeque::new(),
            buffered: 0,
            events: VecDeque::new(),
            observers: Vec::new(),
            stats: ChannelStats::default(),
            refresh_hint: None,
        }
    }

    /// Notifies `hint` whenever the backend rejects the token.
    #[must_use]
    pub fn with_refresh_hint(mut self, hint: Arc<Notify>) -> Self {
        self.refresh_hint = Some(hint);
        self
    }

    /// Adds an observer of lifecycle transitions.
    pub fn register_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.observers.push(observer);
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        match self.link {
            Link::Idle { .. } => ChannelState::Disconnected,
            Link::Connecting(_) => ChannelState::Connecting,
            Link::Connected(_) => ChannelState::Connected,
        }
    }

    /// True when frames can be sent.
    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    /// Config snapshot of the current or most recent attempt.
    pub fn config(&self) -> &PipelineConfig {
        &self.current
    }

    /// Counters.
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Bytes waiting in the write buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Frames waiting in the write buffer.
    pub fn buffered_frames(&self) -> usize {
        self.outbox.len()
    }

    /// Starts connecting unless already connecting or connected.
    ///
    /// A pending retry timer is skipped.
    pub fn connect_async(&mut self) {
        if !matches!(self.link, Link::Idle { .. }) {
            return;
        }

        let config = Arc::clone(&self.config_rx.borrow_and_update());
        if config.token != self.current.token || config.endpoint != self.current.endpoint {
            tracing::info!(endpoint = %config.endpoint, "using refreshed intake configuration");
        }
        self.current = Arc::clone(&config);

        let connector = Arc::clone(&self.connector);
        let options = self.options.clone();
        let auth = Frame::authenticate(&config.token, &self.agent_id, &self.hostname);

        tracing::debug!(endpoint = %config.endpoint, attempt = self.failures + 1, "connecting to intake");
        self.link = Link::Connecting(Box::pin(async move {
            establish(connector.as_ref(), &config, &options, &auth).await
        }));
        metrics::record_channel_state(ChannelState::Connecting.gauge());
    }

    /// Waits for the next lifecycle transition.
    ///
    /// Drives pending connection attempts, fires retry timers and watches the
    /// connected session for closure. Registered observers are notified
    /// before the event is returned. Cancel safe.
    pub async fn next_event(&mut self) -> ChannelEvent {
        loop {
            if let Some(event) = self.events.pop_front() {
                return event;
            }

            match &mut self.link {
                Link::Idle { retry_at: None } => futures::future::pending::<()>().await,
                Link::Idle {
                    retry_at: Some(at),
                } => {
                    sleep_until(*at).await;
                    self.link = Link::Idle { retry_at: None };
                    self.connect_async();
                }
                Link::Connecting(attempt) => {
                    let outcome = attempt.await;
                    match outcome {
                        Ok(session) => self.established(session),
                        Err(reason) => self.lost(reason),
                    }
                }
                Link::Connected(session) => {
                    let mut scratch = [0_u8; 1024];
                    let read = session.reader.read(&mut scratch).await;
                    match read {
                        Ok(0) => self.lost(DisconnectReason::Closed),
                        Ok(n) => tracing::trace!(bytes = n, "ignoring inbound data"),
                        Err(e) => self.lost(DisconnectReason::from_io(&e)),
                    }
                }
            }
        }
    }

    /// Buffers `frame` and writes out the buffer.
    ///
    /// `Ok` means the whole frame was accepted; it is written now or, if the
    /// session breaks first, replayed after the next handshake.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] while not connected and
    /// [`SendError::BufferFull`] when the buffer has no room; in both cases
    /// nothing was buffered and the caller keeps its data.
    /// [`SendError::FrameTooLarge`] when the frame exceeds the whole cap; the
    /// frame is dropped and counted.
    pub async fn send(&mut self, frame: Frame) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        let capacity = self.current.write_buffer_bytes;
        let size = frame.len();
        if size > capacity {
            self.record_drop(1, size);
            return Err(SendError::FrameTooLarge {
                frame: size,
                capacity,
            });
        }
        if self.buffered + size > capacity {
            return Err(SendError::BufferFull {
                buffered: self.buffered,
                capacity,
                frame: size,
            });
        }

        self.buffered += size;
        self.outbox.push_back(frame);
        self.flush().await;
        Ok(())
    }

    /// Writes buffered frames in order.
    ///
    /// Returns true when the buffer is empty afterwards. A write failure
    /// ends the session and keeps the unwritten frames.
    pub async fn flush(&mut self) -> bool {
        while let Some(frame) = self.outbox.front() {
            let Link::Connected(session) = &mut self.link else {
                break;
            };

            let size = frame.len();
            let written = timeout(self.options.write_timeout, async {
                session.writer.write_all(frame.as_bytes()).await?;
                session.writer.flush().await
            })
            .await;

            match written {
                Ok(Ok(())) => {
                    self.outbox.pop_front();
                    self.buffered -= size;
                }
                Ok(Err(e)) => {
                    self.lost(DisconnectReason::Io(e.to_string()));
                    break;
                }
                Err(_) => {
                    self.lost(DisconnectReason::Timeout("write"));
                    break;
                }
            }
        }

        metrics::record_buffered_bytes(self.buffered);
        self.outbox.is_empty()
    }

    /// Ends the session without scheduling a retry.
    pub async fn close(&mut self) {
        if let Link::Connected(session) = &mut self.link {
            let _ = session.writer.shutdown().await;
        }
        self.link = Link::Idle { retry_at: None };
        metrics::record_channel_state(ChannelState::Disconnected.gauge());
    }

    fn established(&mut self, session: Session) {
        self.trim_to_capacity();
        self.link = Link::Connected(session);
        self.failures = 0;
        self.stats.connects += 1;

        tracing::info!(
            endpoint = %self.current.endpoint,
            buffered_frames = self.outbox.len(),
            "connected to intake"
        );
        metrics::record_connect_attempt(true);
        metrics::record_channel_state(ChannelState::Connected.gauge());

        for observer in &mut self.observers {
            observer.on_connected();
        }
        self.events.push_back(ChannelEvent::Connected);
    }

    fn lost(&mut self, reason: DisconnectReason) {
        let was_connected = self.is_connected();
        self.failures = self.failures.saturating_add(1);
        let delay = self.options.backoff.delay_for(self.failures);
        self.link = Link::Idle {
            retry_at: Some(Instant::now() + delay),
        };
        self.stats.disconnects += 1;

        if was_connected {
            tracing::warn!(endpoint = %self.current.endpoint, retry_in = ?delay, "intake session lost: {reason}");
        } else {
            tracing::warn!(endpoint = %self.current.endpoint, retry_in = ?delay, "intake connection failed: {reason}");
            metrics::record_connect_attempt(false);
        }
        metrics::record_disconnect(reason.label());
        metrics::record_channel_state(ChannelState::Disconnected.gauge());

        if let (DisconnectReason::TokenRejected(_), Some(hint)) = (&reason, &self.refresh_hint) {
            hint.notify_one();
        }

        for observer in &mut self.observers {
            observer.on_disconnected(&reason);
        }
        self.events.push_back(ChannelEvent::Disconnected(reason));
    }

    /// Drops trailing frames that no longer fit the current cap.
    fn trim_to_capacity(&mut self) {
        let capacity = self.current.write_buffer_bytes;
        let mut kept = 0;
        let mut keep = 0;
        for frame in &self.outbox {
            if kept + frame.len() > capacity {
                break;
            }
            kept += frame.len();
            keep += 1;
        }

        if keep < self.outbox.len() {
            let dropped: Vec<_> = self.outbox.drain(keep..).collect();
            let bytes = dropped.iter().map(Frame::len).sum();
            self.buffered = kept;
            self.record_drop(dropped.len(), bytes);
        }
    }

    fn record_drop(&mut self, frames: usize, bytes: usize) {
        self.stats.dropped_frames += frames as u64;
        self.stats.dropped_bytes += bytes as u64;
        tracing::error!(frames, bytes, "write buffer overflow, dropping frames");
        metrics::record_dropped(frames, bytes);
    }
}

/// Opens a transport and authenticates on it.
async fn establish(
    connector: &dyn Connector,
    config: &PipelineConfig,
    options: &ChannelOptions,
    auth: &Frame,
) -> Result<Session, DisconnectReason> {
    let transport = match timeout(options.connect_timeout, connector.connect(config)).await {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => return Err(DisconnectReason::ConnectFailed(e.to_string())),
        Err(_) => return Err(DisconnectReason::Timeout("connect")),
    };

    let (mut reader, mut writer) = tokio::io::split(transport);
    match timeout(options.handshake_timeout, handshake(&mut reader, &mut writer, auth)).await {
        Ok(Ok(())) => Ok(Session { reader, writer }),
        Ok(Err(reason)) => Err(reason),
        Err(_) => Err(DisconnectReason::Timeout("handshake")),
    }
}

async fn handshake(
    reader: &mut ReadHalf<BoxedTransport>,
    writer: &mut WriteHalf<BoxedTransport>,
    auth: &Frame,
) -> Result<(), DisconnectReason> {
    writer
        .write_all(auth.as_bytes())
        .await
        .map_err(|e| DisconnectReason::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| DisconnectReason::Io(e.to_string()))?;

    loop {
        let frame = match wire::read_frame(reader, wire::MAX_INBOUND_FRAME).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(DisconnectReason::Closed),
            Err(e) => return Err(DisconnectReason::from_io(&e)),
        };

        if frame.kind() != FrameKind::AuthAck {
            tracing::trace!(kind = ?frame.kind(), "ignoring frame during handshake");
            continue;
        }

        let ack = AuthAckFrame::decode(frame.payload())
            .map_err(|e| DisconnectReason::Protocol(e.to_string()))?;
        return if ack.accepted {
            Ok(())
        } else {
            Err(DisconnectReason::TokenRejected(ack.reason))
        };
    }
}
