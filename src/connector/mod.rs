//! Device connector: the session registry and the public `invoke` entry point.
//!
//! The registry maps each [`SessionIdentifier`] to at most one live
//! [`ChannelSession`]. A new connection for an identifier supersedes the old
//! one under the same write lock that installs it, so two sessions are never
//! addressable for one identifier at once. Statistics are kept per
//! identifier and survive reconnects until explicitly reset or removed.

pub mod identifier;
pub mod session;
pub mod statistics;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, Stream};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub use identifier::SessionIdentifier;
pub use session::{
    ChannelSession, CloseReason, DiscardUnsolicited, SessionOptions, SessionState,
    UnsolicitedMessageHandler,
};
pub use statistics::{ChannelStatistics, ConnectorStatistics, StatisticsSnapshot};

use crate::error::{ConnectorError, Result};
use crate::protocol::Message;

/// Diagnostic view of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub identity_uid: String,
    pub channel_uid: String,
    pub opened_at_ms: u64,
    pub connected_secs: u64,
    pub pending_calls: usize,
}

pub struct DeviceConnector {
    sessions: RwLock<HashMap<SessionIdentifier, Arc<ChannelSession>>>,
    statistics: RwLock<HashMap<SessionIdentifier, Arc<ChannelStatistics>>>,
    options: SessionOptions,
    unsolicited: Arc<dyn UnsolicitedMessageHandler>,
}

impl DeviceConnector {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_unsolicited_handler(options, Arc::new(DiscardUnsolicited))
    }

    pub fn with_unsolicited_handler(
        options: SessionOptions,
        unsolicited: Arc<dyn UnsolicitedMessageHandler>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            statistics: RwLock::new(HashMap::new()),
            options,
            unsolicited,
        }
    }

    /// Create a session over `sink` wired to this registry's statistics and
    /// unsolicited handler, and register it.
    pub async fn open_session<S>(&self, identifier: SessionIdentifier, sink: S) -> Arc<ChannelSession>
    where
        S: Sink<Bytes> + Send + 'static,
        S::Error: fmt::Display,
    {
        let statistics = self.statistics_for(&identifier).await;
        let session = ChannelSession::start(
            identifier.clone(),
            sink,
            statistics,
            self.options.clone(),
            self.unsolicited.clone(),
        );
        self.register(identifier, session.clone()).await;
        session
    }

    /// Register, run the receive loop to completion, then unregister.
    ///
    /// This is the whole lifetime of one controller connection.
    pub async fn run_session<S, R, E>(
        &self,
        identifier: SessionIdentifier,
        sink: S,
        inbound: R,
    ) -> CloseReason
    where
        S: Sink<Bytes> + Send + 'static,
        S::Error: fmt::Display,
        R: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        let session = self.open_session(identifier.clone(), sink).await;
        let keep_alive = self.options.keep_alive_interval.map(|interval| {
            tokio::spawn(
                session
                    .clone()
                    .keep_alive(interval, self.options.keep_alive_timeout),
            )
        });

        let span = info_span!(
            "channel_session",
            identity = %identifier.identity_uid,
            channel = %identifier.channel_uid
        );
        let reason = session.run(inbound).instrument(span).await;

        if let Some(task) = keep_alive {
            task.abort();
        }
        self.unregister(&identifier, &session).await;
        reason
    }

    /// Install `session` for `identifier`, superseding any existing session.
    ///
    /// The session's statistics become the retained record for `identifier`,
    /// even if that record was removed after the session picked it up.
    pub async fn register(&self, identifier: SessionIdentifier, session: Arc<ChannelSession>) {
        let previous = {
            let mut sessions = self.sessions.write().await;
            self.statistics
                .write()
                .await
                .insert(identifier.clone(), session.statistics().clone());
            let previous = sessions.insert(identifier.clone(), session);
            // Close while still holding the lock: once it is released only the
            // new session is reachable.
            if let Some(old) = &previous {
                old.close(CloseReason::Superseded);
            }
            previous
        };
        if previous.is_some() {
            warn!(
                identity = %identifier.identity_uid,
                channel = %identifier.channel_uid,
                "Channel re-registered while a session was live, closed the old one"
            );
        }
        info!(
            identity = %identifier.identity_uid,
            channel = %identifier.channel_uid,
            "Channel session registered"
        );
    }

    /// Remove the mapping only if it still points at `session`. Returns
    /// whether anything was removed.
    pub async fn unregister(
        &self,
        identifier: &SessionIdentifier,
        session: &Arc<ChannelSession>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        let is_current = sessions
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if is_current {
            sessions.remove(identifier);
            info!(
                identity = %identifier.identity_uid,
                channel = %identifier.channel_uid,
                "Channel session unregistered"
            );
        }
        is_current
    }

    /// The live session for `identifier`, if any.
    ///
    /// A session that already closed but has not been unregistered yet is
    /// treated as absent.
    pub async fn session(&self, identifier: &SessionIdentifier) -> Option<Arc<ChannelSession>> {
        self.sessions
            .read()
            .await
            .get(identifier)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub async fn is_connected(&self, identifier: &SessionIdentifier) -> bool {
        self.session(identifier).await.is_some()
    }

    /// Send `message` to the controller behind `identifier` and await its reply.
    ///
    /// Fails immediately with `OpenChannelNotFound` when no session is registered.
    pub async fn invoke(
        &self,
        identifier: &SessionIdentifier,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.invoke_with_cancellation(identifier, message, timeout, &CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancellation(
        &self,
        identifier: &SessionIdentifier,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        // Clone out of the map so the read lock is not held while waiting.
        let session = self
            .session(identifier)
            .await
            .ok_or_else(|| ConnectorError::OpenChannelNotFound(identifier.to_string()))?;
        session
            .invoke_with_cancellation(message, timeout, cancel)
            .await
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| !s.is_closed())
            .map(|s| SessionSummary {
                identity_uid: s.identifier().identity_uid.clone(),
                channel_uid: s.identifier().channel_uid.clone(),
                opened_at_ms: s.opened_at_ms(),
                connected_secs: s.connected_since().elapsed().as_secs(),
                pending_calls: s.pending_count(),
            })
            .collect();
        list.sort_by(|a, b| {
            (a.identity_uid.as_str(), a.channel_uid.as_str())
                .cmp(&(b.identity_uid.as_str(), b.channel_uid.as_str()))
        });
        list
    }

    pub async fn get_statistics(&self) -> ConnectorStatistics {
        let live: Vec<SessionIdentifier> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        let statistics = self.statistics.read().await;
        let entries: Vec<(SessionIdentifier, bool, StatisticsSnapshot)> = statistics
            .iter()
            .map(|(id, stats)| (id.clone(), live.contains(id), stats.snapshot()))
            .collect();
        ConnectorStatistics::aggregate(live.len(), entries)
    }

    /// Retained statistics for one channel (live or not).
    pub async fn get_channel_statistics(
        &self,
        identifier: &SessionIdentifier,
    ) -> Option<StatisticsSnapshot> {
        self.statistics
            .read()
            .await
            .get(identifier)
            .map(|s| s.snapshot())
    }

    /// Zero a channel's counters without touching its session. No-op (returns
    /// false) when nothing is retained for `identifier`.
    pub async fn reset_channel_statistics(&self, identifier: &SessionIdentifier) -> bool {
        match self.statistics.read().await.get(identifier) {
            Some(stats) => {
                stats.reset();
                true
            }
            None => false,
        }
    }

    /// Drop a channel's retained statistics. A live session keeps its record,
    /// which is zeroed instead.
    pub async fn remove_channel_statistics(&self, identifier: &SessionIdentifier) -> bool {
        // Same lock order as `register`, so no session can be installed
        // between the liveness check and the removal.
        let sessions = self.sessions.read().await;
        let mut statistics = self.statistics.write().await;
        let live = sessions.get(identifier).is_some_and(|s| !s.is_closed());
        if live {
            return match statistics.get(identifier) {
                Some(stats) => {
                    stats.reset();
                    true
                }
                None => false,
            };
        }
        statistics.remove(identifier).is_some()
    }

    /// Close every session (process shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<ChannelSession>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close(CloseReason::Shutdown);
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closed all channel sessions");
        }
    }

    async fn statistics_for(&self, identifier: &SessionIdentifier) -> Arc<ChannelStatistics> {
        if let Some(stats) = self.statistics.read().await.get(identifier) {
            return stats.clone();
        }
        self.statistics
            .write()
            .await
            .entry(identifier.clone())
            .or_default()
            .clone()
    }
}
