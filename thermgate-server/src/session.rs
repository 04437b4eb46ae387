//! Sensor sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thermgate_protocol::{Reading, SensorId};
use tokio::sync::oneshot;

/// How the session table assigns sensor identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorIdPolicy {
    /// Identifiers come from a counter that never repeats.
    #[default]
    Monotonic,
    /// The identifier is the active session count at admission. Identifiers
    /// repeat after churn; kept for compatibility with older sensor tooling.
    ReuseSlot,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
    TimedOut,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStatus::Connected => "CONNECTED",
            LinkStatus::Disconnected => "DISCONNECTED",
            LinkStatus::TimedOut => "TIMEOUT",
        };
        f.pad(s)
    }
}

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Owning half of a session's link to the task that holds its transport.
///
/// Dropping the handle wakes the task, which then closes the transport. The
/// ticket identifies the link even when sensor identifiers are reused.
#[derive(Debug)]
pub struct LinkHandle {
    ticket: u64,
    _close: oneshot::Sender<()>,
}

/// Task-side half of a link. Resolves once the session leaves the table.
#[derive(Debug)]
pub struct LinkWatch {
    ticket: u64,
    closed: oneshot::Receiver<()>,
}

/// Creates a connected handle/watch pair.
pub fn link() -> (LinkHandle, LinkWatch) {
    let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    (
        LinkHandle { ticket, _close: tx },
        LinkWatch { ticket, closed: rx },
    )
}

impl LinkHandle {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl LinkWatch {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Waits until the owning session is removed from the table.
    pub async fn closed(&mut self) {
        let _ = (&mut self.closed).await;
    }
}

/// A live sensor session.
#[derive(Debug)]
pub struct Session {
    /// Assigned by the table on insert.
    pub sensor_id: SensorId,
    /// Active session count when this session was admitted.
    pub slot: u32,
    /// Peer address observed on the socket. Admission is charged to it.
    pub address: String,
    /// Address the peer reported in its handshake record.
    pub reported_address: String,
    /// Port the peer reported in its handshake record.
    pub port: u16,
    pub active: bool,
    pub status: LinkStatus,
    /// Whether the link is encrypted.
    pub tls: bool,
    /// Whether the gateway dialed this link itself.
    pub outbound: bool,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    last_active_instant: Instant,
    /// Most recent reading, or the initial placeholder.
    pub latest: Reading,
    link: Option<LinkHandle>,
}

impl Session {
    /// Creates an unregistered session bound to `link`.
    pub fn new(
        address: impl Into<String>,
        reported_address: impl Into<String>,
        port: u16,
        tls: bool,
        link: LinkHandle,
    ) -> Self {
        let now = Utc::now();
        Self {
            sensor_id: SensorId(0),
            slot: 0,
            address: address.into(),
            reported_address: reported_address.into(),
            port,
            active: true,
            status: LinkStatus::Connected,
            tls,
            outbound: false,
            connected_at: now,
            last_active: now,
            last_active_instant: Instant::now(),
            latest: Reading::initial(SensorId(0)),
            link: Some(link),
        }
    }

    /// Marks the session as dialed by the gateway.
    pub fn outbound(mut self) -> Self {
        self.outbound = true;
        self
    }

    /// Records activity now.
    pub fn touch(&mut self) {
        self.last_active = Utc::now();
        self.last_active_instant = Instant::now();
    }

    /// Time since the last recorded activity, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active_instant)
    }

    /// Ticket of the owned link, if any.
    pub fn link_ticket(&self) -> Option<u64> {
        self.link.as_ref().map(LinkHandle::ticket)
    }

    /// Drops the link handle, signalling the owning task to close the
    /// transport. Subsequent calls do nothing.
    pub(crate) fn close_link(&mut self) {
        if self.link.take().is_some() {
            tracing::debug!("[{}] Link released for sensor {}", self.address, self.sensor_id);
        }
    }

    /// Copies the displayable state.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            sensor_id: self.sensor_id,
            slot: self.slot,
            address: self.address.clone(),
            reported_address: self.reported_address.clone(),
            port: self.port,
            active: self.active,
            status: self.status,
            tls: self.tls,
            outbound: self.outbound,
            connected_at: self.connected_at,
            last_active: self.last_active,
            latest: self.latest,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(earlier) = self.last_active_instant.checked_sub(by) {
            self.last_active_instant = earlier;
        }
    }
}

/// Point-in-time copy of a session, safe to hold outside the table lock.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub sensor_id: SensorId,
    pub slot: u32,
    pub address: String,
    pub reported_address: String,
    pub port: u16,
    pub active: bool,
    pub status: LinkStatus,
    pub tls: bool,
    pub outbound: bool,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub latest: Reading,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropping_handle_wakes_watch() {
        let (handle, mut watch) = link();
        assert_eq!(handle.ticket(), watch.ticket());

        let waiter = tokio::spawn(async move {
            watch.closed().await;
        });
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_link_is_idempotent() {
        let (handle, mut watch) = link();
        let mut session = Session::new("10.0.0.1", "10.0.0.1", 9000, false, handle);
        assert!(session.link_ticket().is_some());

        session.close_link();
        session.close_link();
        assert!(session.link_ticket().is_none());
        watch.closed().await;
    }

    #[test]
    fn test_tickets_are_unique() {
        let (a, _wa) = link();
        let (b, _wb) = link();
        assert_ne!(a.ticket(), b.ticket());
    }

    #[test]
    fn test_idle_for() {
        let (handle, _watch) = link();
        let mut session = Session::new("10.0.0.1", "10.0.0.1", 9000, false, handle);
        session.backdate(Duration::from_secs(40));
        assert!(session.idle_for(Instant::now()) >= Duration::from_secs(40));

        session.touch();
        assert!(session.idle_for(Instant::now()) < Duration::from_secs(1));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(LinkStatus::Connected.to_string(), "CONNECTED");
        assert_eq!(LinkStatus::TimedOut.to_string(), "TIMEOUT");
        assert_eq!(format!("{:>12}", LinkStatus::Disconnected), "DISCONNECTED");
    }
}
