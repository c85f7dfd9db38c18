//! Channel session: one live socket, many multiplexed calls.
//!
//! A [`ChannelSession`] owns both halves of one controller connection:
//!
//! - **Writer task**: the only code that touches the socket sink. Callers
//!   enqueue encoded frames on a bounded channel; the task writes them in
//!   order, so concurrent callers never interleave partial frames.
//! - **Receive loop** ([`ChannelSession::run`]): reads one frame at a time,
//!   completes the pending call whose correlation id matches, and hands
//!   everything else to the [`UnsolicitedMessageHandler`].
//! - **Pending table**: correlation id → oneshot sender. An entry leaves the
//!   table exactly once: matched by a response, drained by close, or removed
//!   by the caller's [`PendingCall`] guard on timeout/cancellation.
//!
//! The session is transport-agnostic: any `Sink<Bytes>` plus
//! `Stream<Item = Result<Bytes, E>>` pair works. See [`super::transport`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::identifier::SessionIdentifier;
use super::statistics::{unix_millis, ChannelStatistics};
use crate::error::{ConnectorError, Result};
use crate::protocol::{codec, new_correlation_id, Message, MessageType};

/// Number of abandoned correlation ids remembered for late-response logging.
const ABANDONED_HISTORY: usize = 256;

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_frame_size: usize,
    /// Capacity of the outbound frame queue in front of the writer task.
    pub outbound_queue_size: usize,
    /// Consecutive undecodable frames tolerated before the session is closed
    /// (0 = never close for malformed frames).
    pub max_consecutive_malformed_frames: u32,
    /// Interval between liveness pings; `None` disables them.
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frame_size: codec::DEFAULT_MAX_FRAME_SIZE,
            outbound_queue_size: 256,
            max_consecutive_malformed_frames: 16,
            keep_alive_interval: None,
            keep_alive_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket or the stream ended.
    Disconnected,
    /// The socket reported an error on read.
    Transport(String),
    /// Writing a frame failed.
    WriterFailed(String),
    /// A newer connection registered for the same identifier.
    Superseded,
    /// Too many undecodable frames in a row.
    MalformedFrames(u32),
    /// A liveness ping went unanswered.
    KeepAliveFailed,
    /// Closed locally (process shutdown, explicit close).
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::WriterFailed(e) => write!(f, "write failed: {e}"),
            Self::Superseded => f.write_str("replaced by new connection"),
            Self::MalformedFrames(n) => write!(f, "{n} consecutive malformed frames"),
            Self::KeepAliveFailed => f.write_str("keep-alive ping unanswered"),
            Self::Shutdown => f.write_str("shut down"),
        }
    }
}

/// Receives inbound messages that match no pending call.
///
/// Called from the receive loop, so implementations must not block; spawn a
/// task for anything that awaits.
pub trait UnsolicitedMessageHandler: Send + Sync {
    fn on_message(&self, session: &Arc<ChannelSession>, message: Message);
}

/// Default handler: log and drop.
pub struct DiscardUnsolicited;

impl UnsolicitedMessageHandler for DiscardUnsolicited {
    fn on_message(&self, session: &Arc<ChannelSession>, message: Message) {
        debug!(
            identity = %session.identifier().identity_uid,
            channel = %session.identifier().channel_uid,
            message_type = %message.message_type(),
            correlation_id = message.correlation_id(),
            "Dropping unsolicited message"
        );
    }
}

type Waiter = oneshot::Sender<Result<Message>>;

pub struct ChannelSession {
    identifier: SessionIdentifier,
    outbound: mpsc::Sender<Bytes>,
    pending: Mutex<HashMap<String, Waiter>>,
    /// Ids whose caller gave up, so a late reply can be told apart from a push.
    abandoned: Mutex<VecDeque<String>>,
    statistics: Arc<ChannelStatistics>,
    options: SessionOptions,
    cancel: CancellationToken,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    connected_since: Instant,
    opened_at_ms: u64,
    unsolicited: Arc<dyn UnsolicitedMessageHandler>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelSession {
    /// Create a session over `sink` and spawn its writer task.
    ///
    /// The receive loop is not started; call [`ChannelSession::run`] with the
    /// matching inbound stream.
    pub fn start<S>(
        identifier: SessionIdentifier,
        sink: S,
        statistics: Arc<ChannelStatistics>,
        options: SessionOptions,
        unsolicited: Arc<dyn UnsolicitedMessageHandler>,
    ) -> Arc<Self>
    where
        S: Sink<Bytes> + Send + 'static,
        S::Error: fmt::Display,
    {
        let (outbound, outbound_rx) = mpsc::channel(options.outbound_queue_size.max(1));
        let cancel = CancellationToken::new();
        statistics.record_session_opened();

        Arc::new_cyclic(|weak: &Weak<ChannelSession>| {
            tokio::spawn(write_loop(
                sink,
                outbound_rx,
                cancel.clone(),
                statistics.clone(),
                weak.clone(),
            ));
            Self {
                identifier,
                outbound,
                pending: Mutex::new(HashMap::new()),
                abandoned: Mutex::new(VecDeque::with_capacity(ABANDONED_HISTORY)),
                statistics,
                options,
                cancel,
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                connected_since: Instant::now(),
                opened_at_ms: unix_millis(),
                unsolicited,
            }
        })
    }

    pub fn identifier(&self) -> &SessionIdentifier {
        &self.identifier
    }

    pub fn statistics(&self) -> &Arc<ChannelStatistics> {
        &self.statistics
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.close_reason).clone()
    }

    pub fn connected_since(&self) -> Instant {
        self.connected_since
    }

    /// Unix ms when this session was created.
    pub fn opened_at_ms(&self) -> u64 {
        self.opened_at_ms
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn has_pending(&self, correlation_id: &str) -> bool {
        lock(&self.pending).contains_key(correlation_id)
    }

    /// Encode `message` and queue it for the writer.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectorError::ChannelClosed);
        }
        let frame = codec::encode(message, self.options.max_frame_size)?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ConnectorError::ChannelClosed),
            sent = self.outbound.send(frame) => sent.map_err(|_| ConnectorError::ChannelClosed),
        }
    }

    /// Register `correlation_id` as awaiting a response.
    pub fn begin_pending_call(&self, correlation_id: &str) -> Result<PendingCall<'_>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            // Checked under the table lock: close() flips the flag before draining.
            if self.is_closed() {
                return Err(ConnectorError::ChannelClosed);
            }
            if pending.contains_key(correlation_id) {
                return Err(ConnectorError::DuplicateCorrelationId(
                    correlation_id.to_string(),
                ));
            }
            pending.insert(correlation_id.to_string(), tx);
        }
        Ok(PendingCall {
            session: self,
            correlation_id: correlation_id.to_string(),
            rx,
        })
    }

    /// Send `message` and wait for its correlated response.
    ///
    /// A message without a correlation id is given a fresh one.
    pub async fn invoke(&self, message: Message, timeout: Duration) -> Result<Message> {
        self.invoke_with_cancellation(message, timeout, &CancellationToken::new())
            .await
    }

    /// [`invoke`](Self::invoke) that also fails with `CallCancelled` once
    /// `cancel` fires. Cancellation never affects the session itself.
    pub async fn invoke_with_cancellation(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let message = if message.is_notification() {
            message.with_correlation_id(new_correlation_id())
        } else {
            message
        };
        let mut call = self.begin_pending_call(message.correlation_id())?;

        let exchange = async {
            self.send(&message).await?;
            call.response().await
        };

        let result = tokio::select! {
            biased;
            result = exchange => result,
            () = cancel.cancelled() => Err(ConnectorError::CallCancelled),
            () = tokio::time::sleep(timeout) => {
                Err(ConnectorError::CallTimeout(timeout.as_millis() as u64))
            }
        };

        match &result {
            Err(ConnectorError::CallTimeout(ms)) => {
                self.statistics.record_error();
                warn!(
                    identity = %self.identifier.identity_uid,
                    channel = %self.identifier.channel_uid,
                    correlation_id = message.correlation_id(),
                    timeout_ms = ms,
                    "Call timed out"
                );
            }
            Err(ConnectorError::CallCancelled) => {
                debug!(
                    identity = %self.identifier.identity_uid,
                    channel = %self.identifier.channel_uid,
                    correlation_id = message.correlation_id(),
                    "Call cancelled by caller"
                );
            }
            _ => {}
        }
        result
    }

    /// Read frames until the socket ends or the session is closed.
    ///
    /// On exit the session is closed and every pending call has failed with
    /// `ChannelClosed`. Returns why the session ended.
    pub async fn run<R, E>(self: &Arc<Self>, inbound: R) -> CloseReason
    where
        R: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        let mut inbound = std::pin::pin!(inbound);
        let max_malformed = self.options.max_consecutive_malformed_frames;
        let mut malformed_run: u32 = 0;

        let ended = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break None,
                next = inbound.next() => next,
            };
            let frame = match next {
                None => break Some(CloseReason::Disconnected),
                Some(Err(e)) => break Some(CloseReason::Transport(e.to_string())),
                Some(Ok(frame)) => frame,
            };

            match codec::decode(&frame, self.options.max_frame_size) {
                Ok(message) => {
                    malformed_run = 0;
                    self.statistics.record_received(frame.len());
                    self.dispatch(message);
                }
                Err(e) => {
                    malformed_run += 1;
                    self.statistics.record_error();
                    warn!(
                        identity = %self.identifier.identity_uid,
                        channel = %self.identifier.channel_uid,
                        bytes = frame.len(),
                        consecutive = malformed_run,
                        "Discarding frame: {e}"
                    );
                    if max_malformed > 0 && malformed_run >= max_malformed {
                        break Some(CloseReason::MalformedFrames(malformed_run));
                    }
                }
            }
        };

        if let Some(reason) = ended {
            self.close(reason);
        }
        self.close_reason().unwrap_or(CloseReason::Shutdown)
    }

    /// Close the session: stop both loops and fail every pending call.
    /// Returns false if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.close_reason) = Some(reason.clone());
        self.cancel.cancel();

        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        let failed = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(ConnectorError::ChannelClosed));
        }

        info!(
            identity = %self.identifier.identity_uid,
            channel = %self.identifier.channel_uid,
            failed_calls = failed,
            connected_secs = self.connected_since.elapsed().as_secs(),
            "Channel session closed: {reason}"
        );
        true
    }

    /// Ping the peer every `interval`; close the session when a ping times out.
    pub async fn keep_alive(self: Arc<Self>, interval: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let ping = Message::request(MessageType::Ping, Bytes::new());
            match self.invoke(ping, timeout).await {
                Ok(_) => {}
                Err(ConnectorError::CallTimeout(_)) => {
                    self.close(CloseReason::KeepAliveFailed);
                    return;
                }
                Err(e) => {
                    debug!(
                        identity = %self.identifier.identity_uid,
                        channel = %self.identifier.channel_uid,
                        "Keep-alive stopped: {e}"
                    );
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        if !message.is_notification() {
            let waiter = lock(&self.pending).remove(message.correlation_id());
            if let Some(tx) = waiter {
                if tx.send(Ok(message)).is_err() {
                    debug!(
                        identity = %self.identifier.identity_uid,
                        channel = %self.identifier.channel_uid,
                        "Response arrived as caller went away (dropped)"
                    );
                }
                return;
            }
            if self.forget_abandoned(message.correlation_id()) {
                info!(
                    identity = %self.identifier.identity_uid,
                    channel = %self.identifier.channel_uid,
                    correlation_id = message.correlation_id(),
                    "Response arrived for timed-out or cancelled call (dropped)"
                );
                return;
            }
        }
        self.unsolicited.on_message(self, message);
    }

    fn remember_abandoned(&self, correlation_id: String) {
        let mut abandoned = lock(&self.abandoned);
        if abandoned.len() >= ABANDONED_HISTORY {
            abandoned.pop_front();
        }
        abandoned.push_back(correlation_id);
    }

    fn forget_abandoned(&self, correlation_id: &str) -> bool {
        let mut abandoned = lock(&self.abandoned);
        if let Some(pos) = abandoned.iter().position(|id| id == correlation_id) {
            abandoned.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Handle for one registered correlation id.
///
/// Dropping it before a response arrived removes the table entry, so timeouts,
/// cancellation, and dropped caller futures all clean up the same way.
pub struct PendingCall<'a> {
    session: &'a ChannelSession,
    correlation_id: String,
    rx: oneshot::Receiver<Result<Message>>,
}

impl PendingCall<'_> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Await the response. Fails with `ChannelClosed` if the session dies first.
    pub async fn response(&mut self) -> Result<Message> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::ChannelClosed),
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        // Closing our receiver marks our sender closed, which identifies our
        // entry even if the id was since re-registered by another call.
        self.rx.close();
        let removed = {
            let mut pending = lock(&self.session.pending);
            if pending
                .get(&self.correlation_id)
                .is_some_and(oneshot::Sender::is_closed)
            {
                pending.remove(&self.correlation_id);
                true
            } else {
                false
            }
        };
        if removed {
            self.session
                .remember_abandoned(std::mem::take(&mut self.correlation_id));
        }
    }
}

async fn write_loop<S>(
    sink: S,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    statistics: Arc<ChannelStatistics>,
    session: Weak<ChannelSession>,
) where
    S: Sink<Bytes> + Send + 'static,
    S::Error: fmt::Display,
{
    let mut sink = std::pin::pin!(sink);
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let len = frame.len();
        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            written = sink.send(frame) => written,
        };
        match written {
            Ok(()) => statistics.record_sent(len),
            Err(e) => {
                statistics.record_error();
                if let Some(session) = session.upgrade() {
                    session.close(CloseReason::WriterFailed(e.to_string()));
                } else {
                    cancel.cancel();
                }
                break;
            }
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
}
