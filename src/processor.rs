//! The resync processor: batching, heartbeats and channel lifecycle.
//!
//! One processor runs as a single task that owns both the [`ResyncDrain`]
//! and the [`DeliveryChannel`]. Everything that touches the batch or the
//! channel happens on that task, so neither needs locking.
//!
//! ```text
//!            item drained               threshold reached, Connected
//!   Idle ─────────────────► Accumulating ────────────────────────────► Flushing
//!    ▲                          ▲   │ not Connected: hold the batch        │
//!    │                          └───┘                                      │
//!    └──────────────────── send accepted ──────────────────────────────────┘
//! ```
//!
//! Items leave the queue in order, enter the batch in order and the batch is
//! only released once the channel accepted its frame, so a disconnect never
//! loses or reorders anything.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};

use crate::channel::{ChannelEvent, ChannelObserver, DeliveryChannel, DisconnectReason};
use crate::config::{BatchConfig, RelayConfig};
use crate::error::SendError;
use crate::metadata::{self, HostMetadata, MetadataSource};
use crate::metrics;
use crate::model::{ResyncBatch, ResyncItem};
use crate::queue::ResyncDrain;
use crate::wire::Frame;

/// Where the processor is in its batching cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No open batch.
    Idle,
    /// A batch is open and below every flush threshold, or held while
    /// disconnected.
    Accumulating,
    /// A batch is being handed to the channel.
    Flushing,
}

/// Tracks when the last frame was accepted by the channel.
///
/// Connecting does not reset the clock: after a long outage the first thing
/// sent on a fresh session is a heartbeat unless a batch is ready. Only a
/// successful send resets it; a failed heartbeat is retried after a delay
/// set with [`HeartbeatClock::defer`].
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatClock {
    last_send: Instant,
    retry_at: Option<Instant>,
}

impl HeartbeatClock {
    /// Starts the clock at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            last_send: now,
            retry_at: None,
        }
    }

    /// Records a successful send.
    pub fn reset(&mut self, now: Instant) {
        self.last_send = now;
        self.retry_at = None;
    }

    /// Holds off the next attempt until `at` without counting as a send.
    pub fn defer(&mut self, at: Instant) {
        self.retry_at = Some(at);
    }

    /// When the last frame was accepted.
    pub fn last_send(&self) -> Instant {
        self.last_send
    }

    /// When the next heartbeat is due.
    pub fn due_at(&self, interval: Duration) -> Instant {
        let due = self.last_send + interval;
        self.retry_at.map_or(due, |at| due.max(at))
    }

    /// True once `interval` has passed without a send.
    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        now >= self.due_at(interval)
    }
}

/// Drains the resync queue into batches and hands them to the channel.
pub struct ResyncProcessor {
    channel: DeliveryChannel,
    drain: ResyncDrain,
    metadata: HostMetadata,
    metadata_source: Option<Arc<dyn MetadataSource>>,
    batch_config: BatchConfig,
    check_interval: Duration,
    metadata_timeout: Duration,
    shutdown_grace: Duration,
    backlog: VecDeque<ResyncItem>,
    batch: Option<ResyncBatch>,
    heartbeat: HeartbeatClock,
    state: ProcessorState,
    stalled_until: Option<Instant>,
    replay_pending: bool,
}

impl std::fmt::Debug for ResyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncProcessor")
            .field("state", &self.state)
            .field("channel", &self.channel)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl ResyncProcessor {
    /// Creates a processor; `metadata` is attached to every batch unless a
    /// metadata source replaces its cloud part at startup.
    pub fn new(
        channel: DeliveryChannel,
        drain: ResyncDrain,
        config: &RelayConfig,
        metadata: HostMetadata,
    ) -> Self {
        Self {
            channel,
            drain,
            metadata,
            metadata_source: None,
            batch_config: config.batch.clone(),
            check_interval: config.check_interval,
            metadata_timeout: config.metadata_timeout,
            shutdown_grace: config.shutdown_grace,
            backlog: VecDeque::new(),
            batch: None,
            heartbeat: HeartbeatClock::new(Instant::now()),
            state: ProcessorState::Idle,
            stalled_until: None,
            replay_pending: false,
        }
    }

    /// Looks up cloud metadata from `source` when the processor starts.
    #[must_use]
    pub fn with_metadata_source(mut self, source: Arc<dyn MetadataSource>) -> Self {
        self.metadata_source = Some(source);
        self
    }

    /// Current batching state.
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// The owned delivery channel.
    pub fn channel(&self) -> &DeliveryChannel {
        &self.channel
    }

    /// Metadata attached to batches.
    pub fn metadata(&self) -> &HostMetadata {
        &self.metadata
    }

    /// Runs until `shutdown` completes, then flushes what it can within the
    /// grace period.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Some(source) = self.metadata_source.take() {
            self.metadata = metadata::enrich(
                source.as_ref(),
                &self.metadata.agent_id,
                &self.metadata.hostname,
                self.metadata_timeout,
            )
            .await;
        }

        tracing::info!(
            agent_id = %self.metadata.agent_id,
            endpoint = %self.channel.config().endpoint,
            "resync processor started"
        );
        self.channel.connect_async();

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            if self.replay_pending {
                self.replay_pending = false;
                self.channel.flush().await;
            }
            self.fill();
            if self.tick().await {
                continue;
            }

            let room = self.room();
            let wait = self.next_wait(Instant::now());
            let finished = self.drain.is_finished();

            tokio::select! {
                biased;

                () = &mut shutdown => break,
                event = self.channel.next_event() => self.dispatch(&event),
                items = self.drain.drain(room, wait), if room > 0 && !finished => {
                    self.backlog.extend(items);
                }
                () = sleep(wait), if room == 0 || finished => {}
            }
        }

        self.shutdown().await;
    }

    /// Flushes a ready batch or sends a due heartbeat. Returns true when a
    /// batch left the processor, so the caller can look for the next one.
    async fn tick(&mut self) -> bool {
        if !self.channel.is_connected() {
            return false;
        }

        let now = Instant::now();
        let stalled = self.stalled_until.is_some_and(|until| now < until);
        if !stalled {
            if let Some(trigger) = self.flush_trigger(now) {
                return self.flush(trigger).await;
            }
        }

        let interval = self.channel.config().heartbeat_interval;
        if self.heartbeat.is_due(now, interval) {
            self.send_heartbeat(now).await;
        }
        false
    }

    /// Moves backlog items into the batch until a size threshold is reached.
    ///
    /// An item that would take a non-empty batch past the byte limit starts
    /// the next batch instead.
    fn fill(&mut self) {
        while !self.batch_full() {
            let Some(item) = self.backlog.pop_front() else {
                break;
            };
            self.batch
                .get_or_insert_with(|| ResyncBatch::open(Instant::now()))
                .push(item);
            self.state = ProcessorState::Accumulating;
        }
    }

    fn batch_full(&self) -> bool {
        let Some(batch) = self.batch.as_ref().filter(|batch| !batch.is_empty()) else {
            return false;
        };
        batch.is_split() || batch.len() >= self.batch_config.max_items || self.bytes_full(batch)
    }

    fn bytes_full(&self, batch: &ResyncBatch) -> bool {
        let limit = self.batch_config.max_bytes;
        batch.bytes() >= limit
            || self
                .backlog
                .front()
                .is_some_and(|next| batch.bytes() + next.weight() > limit)
    }

    /// How many items the next drain may take.
    fn room(&self) -> usize {
        if !self.backlog.is_empty() || self.batch_full() {
            return 0;
        }
        let open = self.batch.as_ref().map_or(0, ResyncBatch::len);
        self.batch_config.max_items - open
    }

    fn flush_trigger(&self, now: Instant) -> Option<&'static str> {
        let batch = self.batch.as_ref().filter(|batch| !batch.is_empty())?;
        if batch.len() >= self.batch_config.max_items {
            Some("count")
        } else if self.bytes_full(batch) {
            Some("bytes")
        } else if batch.is_split() {
            Some("split")
        } else if now >= batch.opened_at() + self.batch_config.max_latency {
            Some("latency")
        } else {
            None
        }
    }

    /// Time until something needs doing, capped by the check interval.
    fn next_wait(&self, now: Instant) -> Duration {
        let mut deadline = now + self.check_interval;

        if self.channel.is_connected() {
            if let Some(batch) = &self.batch {
                let mut flush_at = batch.opened_at() + self.batch_config.max_latency;
                if let Some(until) = self.stalled_until {
                    flush_at = flush_at.max(until);
                }
                deadline = deadline.min(flush_at);
            }
            let interval = self.channel.config().heartbeat_interval;
            deadline = deadline.min(self.heartbeat.due_at(interval));
        }

        deadline.saturating_duration_since(now)
    }

    /// Hands the open batch to the channel. A batch whose frame exceeds the
    /// write buffer cap is halved until it fits; the cut-off tail stays open
    /// as the next batch.
    async fn flush(&mut self, trigger: &'static str) -> bool {
        let Some(mut batch) = self.batch.take() else {
            return false;
        };

        self.state = ProcessorState::Flushing;
        let capacity = self.channel.config().write_buffer_bytes;
        let mut frame = Frame::batch(&self.metadata, batch.items());
        let mut rest: Option<ResyncBatch> = None;
        while frame.len() > capacity && batch.len() > 1 {
            let mut tail = batch.split_off(batch.len() / 2);
            if let Some(later) = rest.take() {
                tail.append(later);
            }
            rest = Some(tail);
            frame = Frame::batch(&self.metadata, batch.items());
        }
        if let Some(rest) = &rest {
            tracing::debug!(
                items = batch.len(),
                deferred = rest.len(),
                capacity,
                "splitting batch to fit the write buffer"
            );
        }
        let frame_bytes = frame.len();

        match self.channel.send(frame).await {
            Ok(()) => {
                let now = Instant::now();
                self.heartbeat.reset(now);
                self.stalled_until = None;
                tracing::debug!(items = batch.len(), bytes = frame_bytes, trigger, "batch flushed");
                metrics::record_batch_flushed(trigger, batch.len(), frame_bytes);
                self.release(rest);
                true
            }
            Err(e @ SendError::FrameTooLarge { .. }) => {
                tracing::error!(items = batch.len(), "dropping batch: {e}");
                self.release(rest);
                true
            }
            Err(e) => {
                if let Some(rest) = rest {
                    batch.append(rest);
                }
                tracing::debug!(items = batch.len(), "holding batch: {e}");
                self.batch = Some(batch);
                self.state = ProcessorState::Accumulating;
                if self.channel.is_connected() {
                    self.stalled_until = Some(Instant::now() + self.check_interval);
                }
                false
            }
        }
    }

    /// Keeps the split-off tail of a sent batch as the open batch.
    fn release(&mut self, rest: Option<ResyncBatch>) {
        self.state = if rest.is_some() {
            ProcessorState::Accumulating
        } else {
            ProcessorState::Idle
        };
        self.batch = rest;
    }

    async fn send_heartbeat(&mut self, now: Instant) {
        match self.channel.send(Frame::heartbeat()).await {
            Ok(()) => {
                tracing::trace!("heartbeat sent");
                metrics::record_heartbeat();
                self.heartbeat.reset(now);
            }
            Err(e) => {
                tracing::debug!("heartbeat not sent: {e}");
                self.heartbeat.defer(now + self.check_interval);
            }
        }
    }

    fn dispatch(&mut self, event: &ChannelEvent) {
        event.dispatch(self);
    }

    async fn shutdown(mut self) {
        self.drain.close();
        let queued = self.drain.try_drain(usize::MAX);
        self.backlog.extend(queued);

        let pending = self.pending_items();
        tracing::info!(
            items = pending,
            grace = ?self.shutdown_grace,
            "resync processor stopping"
        );

        if timeout(self.shutdown_grace, self.flush_remaining()).await.is_err() {
            tracing::warn!("shutdown grace period elapsed");
        }

        let lost = self.pending_items();
        if lost > 0 {
            tracing::error!(items = lost, "undelivered items lost at shutdown");
        }
        if self.channel.buffered_frames() > 0 {
            tracing::error!(
                frames = self.channel.buffered_frames(),
                bytes = self.channel.buffered_bytes(),
                "unwritten frames lost at shutdown"
            );
        }
        self.channel.close().await;
    }

    /// Sends everything held, waiting for reconnects as needed. Bounded by
    /// the caller.
    async fn flush_remaining(&mut self) {
        loop {
            if self.replay_pending {
                self.replay_pending = false;
                self.channel.flush().await;
            }
            self.fill();

            let has_batch = self.batch.as_ref().is_some_and(|batch| !batch.is_empty());
            if self.channel.is_connected() {
                if has_batch {
                    if self.flush("shutdown").await {
                        continue;
                    }
                } else if self.channel.flush().await {
                    return;
                }
            } else if !has_batch && self.channel.buffered_frames() == 0 {
                return;
            }

            let event = self.channel.next_event().await;
            self.dispatch(&event);
        }
    }

    fn pending_items(&self) -> usize {
        self.backlog.len() + self.batch.as_ref().map_or(0, ResyncBatch::len)
    }
}

impl ChannelObserver for ResyncProcessor {
    fn on_connected(&mut self) {
        self.replay_pending = true;
        self.stalled_until = None;
        if let Some(batch) = &self.batch {
            tracing::debug!(items = batch.len(), "retrying held batch");
        }
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        self.replay_pending = false;
        let held = self.pending_items();
        if held > 0 {
            tracing::debug!(items = held, "holding items until reconnected: {reason}");
        }
    }
}
