//! Per-channel usage counters and their global aggregation.
//!
//! Counters are atomics so the receive loop and concurrent callers update
//! them without locking. Records are owned by the registry and outlive the
//! session that fed them, so a reconnect keeps accumulating into the same one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::identifier::SessionIdentifier;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[derive(Debug, Default)]
pub struct ChannelStatistics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    last_activity_ms: AtomicU64,
    session_opened_ms: AtomicU64,
}

/// Point-in-time copy of a [`ChannelStatistics`] record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    /// Unix ms of the last frame in either direction (0 = never).
    pub last_activity_ms: u64,
    /// Unix ms when the most recent session on this channel opened (0 = never).
    pub session_opened_ms: u64,
}

impl ChannelStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_opened(&self) {
        let now = unix_millis();
        self.session_opened_ms.store(now, Ordering::Relaxed);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the counters. Timestamps are kept.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
            session_opened_ms: self.session_opened_ms.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsSnapshot {
    /// Add `other`'s counters into `self`; timestamps take the latest.
    pub fn accumulate(&mut self, other: &StatisticsSnapshot) {
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.errors += other.errors;
        self.last_activity_ms = self.last_activity_ms.max(other.last_activity_ms);
        self.session_opened_ms = self.session_opened_ms.max(other.session_opened_ms);
    }
}

/// Statistics for one channel as reported by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatisticsEntry {
    pub identity_uid: String,
    pub channel_uid: String,
    /// Whether a live session currently exists for this channel.
    pub connected: bool,
    #[serde(flatten)]
    pub statistics: StatisticsSnapshot,
}

/// Process-wide view: totals plus every retained channel.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatistics {
    pub open_sessions: usize,
    pub totals: StatisticsSnapshot,
    pub channels: Vec<ChannelStatisticsEntry>,
}

impl ConnectorStatistics {
    pub fn aggregate(
        open_sessions: usize,
        entries: impl IntoIterator<Item = (SessionIdentifier, bool, StatisticsSnapshot)>,
    ) -> Self {
        let mut totals = StatisticsSnapshot::default();
        let mut channels: Vec<ChannelStatisticsEntry> = entries
            .into_iter()
            .map(|(id, connected, statistics)| {
                totals.accumulate(&statistics);
                ChannelStatisticsEntry {
                    identity_uid: id.identity_uid,
                    channel_uid: id.channel_uid,
                    connected,
                    statistics,
                }
            })
            .collect();
        channels.sort_by(|a, b| {
            (a.identity_uid.as_str(), a.channel_uid.as_str())
                .cmp(&(b.identity_uid.as_str(), b.channel_uid.as_str()))
        });
        Self {
            open_sessions,
            totals,
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_counters_but_keeps_timestamps() {
        let stats = ChannelStatistics::new();
        stats.record_session_opened();
        stats.record_sent(10);
        stats.record_received(4);
        stats.record_error();
        let before = stats.snapshot();
        assert_eq!(before.messages_sent, 1);
        assert_eq!(before.bytes_received, 4);

        stats.reset();
        let after = stats.snapshot();
        assert_eq!(after.messages_sent, 0);
        assert_eq!(after.messages_received, 0);
        assert_eq!(after.bytes_sent, 0);
        assert_eq!(after.errors, 0);
        assert_eq!(after.session_opened_ms, before.session_opened_ms);
        assert!(after.last_activity_ms >= before.session_opened_ms);
    }

    #[test]
    fn aggregate_sums_channels_in_identifier_order() {
        let a = StatisticsSnapshot {
            messages_sent: 2,
            bytes_sent: 20,
            last_activity_ms: 5,
            ..Default::default()
        };
        let b = StatisticsSnapshot {
            messages_sent: 3,
            errors: 1,
            last_activity_ms: 9,
            ..Default::default()
        };
        let global = ConnectorStatistics::aggregate(
            1,
            vec![
                (SessionIdentifier::new("z", "default"), true, a),
                (SessionIdentifier::new("a", "default"), false, b),
            ],
        );
        assert_eq!(global.totals.messages_sent, 5);
        assert_eq!(global.totals.errors, 1);
        assert_eq!(global.totals.last_activity_ms, 9);
        assert_eq!(global.channels[0].identity_uid, "a");
        assert!(!global.channels[0].connected);
    }
}
