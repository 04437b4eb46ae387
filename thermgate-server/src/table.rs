//! Session table.
//!
//! The table is the only owner of live sessions. Removing a session releases
//! its admission permit and drops its link handle, which tells the task that
//! holds the transport to close it. The admission lock and the table lock
//! are never held together: permits are taken before the table is locked and
//! returned after it is unlocked.

use crate::admission::AdmissionLedger;
use crate::error::InsertError;
use crate::session::{LinkStatus, SensorIdPolicy, Session, SessionInfo};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thermgate_protocol::{Reading, SensorId};

struct TableInner {
    /// Newest first.
    sessions: VecDeque<Session>,
    active_count: u32,
    running_port: u16,
    next_id: u32,
}

impl TableInner {
    fn position(&self, sensor_id: SensorId) -> Option<usize> {
        self.sessions.iter().position(|s| s.sensor_id == sensor_id)
    }

    fn take_at(&mut self, index: usize) -> Option<Session> {
        let session = self.sessions.remove(index)?;
        self.active_count = self.active_count.saturating_sub(1);
        Some(session)
    }

    fn connected_on_port(&self, port: u16) -> Option<SensorId> {
        self.sessions
            .iter()
            .find(|s| s.port == port && s.status == LinkStatus::Connected)
            .map(|s| s.sensor_id)
    }
}

/// Registry of active sensor sessions.
pub struct SessionTable {
    inner: Mutex<TableInner>,
    admission: Arc<AdmissionLedger>,
    policy: SensorIdPolicy,
}

impl SessionTable {
    pub fn new(admission: Arc<AdmissionLedger>, policy: SensorIdPolicy) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                sessions: VecDeque::new(),
                active_count: 0,
                running_port: 0,
                next_id: 0,
            }),
            admission,
            policy,
        }
    }

    /// Admits and registers a session, returning its sensor id.
    ///
    /// On error the session is dropped, which closes its link.
    pub fn insert(&self, mut session: Session) -> Result<SensorId, InsertError> {
        if !self.admission.allow(&session.address) {
            return Err(InsertError::AdmissionDenied {
                address: session.address,
            });
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.connected_on_port(session.port) {
            drop(inner);
            self.admission.release(&session.address);
            return Err(InsertError::DuplicatePort {
                port: session.port,
                existing,
            });
        }

        let slot = inner.active_count;
        let id = match self.policy {
            SensorIdPolicy::Monotonic => {
                let id = inner.next_id;
                inner.next_id = inner.next_id.wrapping_add(1);
                id
            }
            SensorIdPolicy::ReuseSlot => slot,
        };

        let sensor_id = SensorId(id);
        session.sensor_id = sensor_id;
        session.slot = slot;
        session.latest = Reading::initial(sensor_id);
        inner.sessions.push_front(session);
        inner.active_count += 1;
        Ok(sensor_id)
    }

    /// Removes a session by id. Absent ids are ignored.
    pub fn remove(&self, sensor_id: SensorId) -> Option<SessionInfo> {
        let session = {
            let mut inner = self.inner.lock();
            let index = inner.position(sensor_id)?;
            inner.take_at(index)
        }?;
        Some(self.teardown(session, LinkStatus::Disconnected))
    }

    /// Removes the session owning link `ticket`, if it is still registered.
    ///
    /// Used by the task holding a transport when the peer goes away, so a
    /// session that replaced it under a reused id is left alone.
    pub fn remove_link(&self, ticket: u64) -> Option<SessionInfo> {
        let session = {
            let mut inner = self.inner.lock();
            let index = inner
                .sessions
                .iter()
                .position(|s| s.link_ticket() == Some(ticket))?;
            inner.take_at(index)
        }?;
        Some(self.teardown(session, LinkStatus::Disconnected))
    }

    /// Returns a copy of the session.
    pub fn find(&self, sensor_id: SensorId) -> Option<SessionInfo> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .find(|s| s.sensor_id == sensor_id)
            .map(Session::info)
    }

    /// Replaces the cached reading and refreshes activity. Returns false if
    /// the sensor is not registered.
    pub fn update_reading(&self, sensor_id: SensorId, reading: Reading) -> bool {
        let mut inner = self.inner.lock();
        match inner.position(sensor_id) {
            Some(index) => {
                let session = &mut inner.sessions[index];
                session.latest = reading;
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Copies every session, newest first.
    pub fn snapshot_for_display(&self) -> Vec<SessionInfo> {
        self.inner.lock().sessions.iter().map(Session::info).collect()
    }

    /// Removes every active session idle for longer than `timeout` at `now`.
    pub fn reap_idle(&self, now: Instant, timeout: Duration) -> Vec<SessionInfo> {
        let expired: Vec<Session> = {
            let mut inner = self.inner.lock();
            let mut expired = Vec::new();
            let mut index = 0;
            while index < inner.sessions.len() {
                let session = &inner.sessions[index];
                if session.active && session.idle_for(now) > timeout {
                    if let Some(session) = inner.take_at(index) {
                        expired.push(session);
                    }
                } else {
                    index += 1;
                }
            }
            expired
        };

        expired
            .into_iter()
            .map(|session| self.teardown(session, LinkStatus::TimedOut))
            .collect()
    }

    /// Whether a connected session reports `port`.
    pub fn port_in_use(&self, port: u16) -> bool {
        self.inner.lock().connected_on_port(port).is_some()
    }

    /// Ids of sessions currently marked active, newest first.
    pub fn active_sensor_ids(&self) -> Vec<SensorId> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter(|s| s.active)
            .map(|s| s.sensor_id)
            .collect()
    }

    /// Tears down every session. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<Session> = {
            let mut inner = self.inner.lock();
            inner.active_count = 0;
            inner.sessions.drain(..).collect()
        };
        let count = drained.len();
        for session in drained {
            self.teardown(session, LinkStatus::Disconnected);
        }
        count
    }

    pub fn active_count(&self) -> u32 {
        self.inner.lock().active_count
    }

    pub fn running_port(&self) -> u16 {
        self.inner.lock().running_port
    }

    pub fn set_running_port(&self, port: u16) {
        self.inner.lock().running_port = port;
    }

    pub fn admission(&self) -> &AdmissionLedger {
        &self.admission
    }

    fn teardown(&self, mut session: Session, status: LinkStatus) -> SessionInfo {
        self.admission.release(&session.address);
        session.active = false;
        session.status = status;
        session.close_link();
        session.info()
    }
}
