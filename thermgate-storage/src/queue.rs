//! Write-behind reading queue.
//!
//! Readings are appended to an in-memory FIFO and persisted by a periodic
//! drain cycle. The cycle owns the SQLite connection: it opens it on demand,
//! counts failed attempts, and reports a fatal error once the retry ceiling is
//! reached. A reading that fails to insert stays where it is and is retried on
//! the next cycle, so one bad entry never blocks the ones behind it.

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thermgate_protocol::{Reading, SensorId};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS sensor_data \
     (id INTEGER PRIMARY KEY, timestamp INTEGER, sensor_id INTEGER, temperature REAL)";

const INSERT_SQL: &str =
    "INSERT INTO sensor_data (timestamp, sensor_id, temperature) VALUES (?1, ?2, ?3)";

const SELECT_ALL_SQL: &str =
    "SELECT timestamp, sensor_id, temperature FROM sensor_data ORDER BY timestamp ASC, id ASC";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Consecutive failed connection attempts tolerated before giving up.
    pub retry_limit: u32,
    /// Wait between failed connection attempts.
    pub retry_delay: Duration,
    /// Interval between drain cycles.
    pub drain_interval: Duration,
}

impl QueueConfig {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            retry_limit: 3,
            retry_delay: Duration::from_secs(5),
            drain_interval: Duration::from_secs(1),
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }
}

/// Database connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for DbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbStatus::Connected => write!(f, "CONNECTED"),
            DbStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Connection state guarded by the queue's database lock.
struct DbState {
    status: DbStatus,
    retry_count: u32,
    last_retry: Option<DateTime<Utc>>,
    /// Present only while `status == Connected`.
    handle: Option<Connection>,
}

/// Result of a single drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Readings written and removed from the queue.
    pub persisted: usize,
    /// Readings that failed to insert and were left in place.
    pub failed: usize,
}

/// What one drain cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Connected (or already was) and drained the queue.
    Drained(DrainReport),
    /// Connection attempt failed; the caller should wait `retry_delay`.
    Backoff { attempt: u32 },
}

/// Pending-write queue plus its database connection.
pub struct StorageQueue {
    config: QueueConfig,
    pending: Mutex<VecDeque<Reading>>,
    db: Mutex<DbState>,
    delivered: AtomicU64,
}

impl StorageQueue {
    /// Creates a disconnected queue. No I/O happens until the first cycle.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(VecDeque::new()),
            db: Mutex::new(DbState {
                status: DbStatus::Disconnected,
                retry_count: 0,
                last_retry: None,
                handle: None,
            }),
            delivered: AtomicU64::new(0),
        }
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends a reading to the tail of the queue.
    pub fn enqueue(&self, reading: Reading) {
        self.pending.lock().push_back(reading);
    }

    /// Number of readings waiting to be persisted.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Lifetime count of readings persisted.
    pub fn delivered_total(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> DbStatus {
        self.db.lock().status
    }

    pub fn retry_count(&self) -> u32 {
        self.db.lock().retry_count
    }

    pub fn last_retry(&self) -> Option<DateTime<Utc>> {
        self.db.lock().last_retry
    }

    /// Makes one connection attempt.
    ///
    /// On success the retry counter is reset. On failure it is incremented;
    /// reaching the configured limit yields `RetryLimitReached`, any other
    /// failure is returned as-is and may be retried.
    pub fn try_connect(&self) -> Result<(), StorageError> {
        let mut db = self.db.lock();
        if db.status == DbStatus::Connected {
            return Ok(());
        }

        match open_database(&self.config.db_path) {
            Ok(conn) => {
                db.handle = Some(conn);
                db.status = DbStatus::Connected;
                db.retry_count = 0;
                tracing::info!(
                    "Connected to SQL database {}",
                    self.config.db_path.display()
                );
                Ok(())
            }
            Err(e) => {
                db.handle = None;
                db.status = DbStatus::Disconnected;
                db.retry_count += 1;
                db.last_retry = Some(Utc::now());

                if db.retry_count >= self.config.retry_limit {
                    tracing::error!(
                        "Max retry attempts reached opening {}: {}",
                        self.config.db_path.display(),
                        e
                    );
                    return Err(StorageError::RetryLimitReached {
                        attempts: db.retry_count,
                    });
                }

                tracing::warn!(
                    "Failed to open database {} (attempt {}/{}): {}",
                    self.config.db_path.display(),
                    db.retry_count,
                    self.config.retry_limit,
                    e
                );
                Err(e)
            }
        }
    }

    /// Persists every pending reading in one transaction.
    ///
    /// Entries that fail to insert are logged with SQLite's message and kept
    /// for the next pass. Successful entries are only unlinked once the
    /// transaction commits. If a failure rolls back the transaction itself,
    /// the pass stops with an error and nothing is unlinked.
    pub fn drain(&self) -> Result<DrainReport, StorageError> {
        let batch: Vec<Reading> = self.pending.lock().iter().copied().collect();
        if batch.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut persisted = vec![false; batch.len()];
        let mut report = DrainReport::default();

        {
            let mut db = self.db.lock();
            let conn = db.handle.as_mut().ok_or(StorageError::NotConnected)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(INSERT_SQL)?;
                for (i, reading) in batch.iter().enumerate() {
                    let result = stmt.execute(params![
                        reading.timestamp,
                        reading.sensor_id.get(),
                        f64::from(reading.temperature),
                    ]);
                    match result {
                        Ok(_) => {
                            persisted[i] = true;
                            report.persisted += 1;
                        }
                        // Some failures (disk full, I/O errors, RAISE(ROLLBACK))
                        // roll back the whole transaction. Any further insert
                        // would then autocommit on its own, so give up on the
                        // pass and leave every entry pending.
                        Err(e) if tx.is_autocommit() => {
                            return Err(StorageError::TransactionAborted(e));
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::error!(
                                "Failed to persist reading from sensor {}: {}",
                                reading.sensor_id,
                                e
                            );
                        }
                    }
                }
            }
            tx.commit()?;
        }

        // The drain is the only remover and enqueue only appends, so the
        // snapshot is still the prefix of the queue.
        let mut pending = self.pending.lock();
        let mut index = 0;
        pending.retain(|_| {
            let keep = index >= persisted.len() || !persisted[index];
            index += 1;
            keep
        });
        drop(pending);

        self.delivered
            .fetch_add(report.persisted as u64, Ordering::Relaxed);
        Ok(report)
    }

    /// Runs one cycle: connect if needed, then drain.
    ///
    /// A drain that fails as a whole (as opposed to a single bad entry)
    /// drops the connection so the next cycle reconnects.
    pub fn cycle(&self) -> Result<CycleOutcome, StorageError> {
        if self.status() == DbStatus::Disconnected {
            match self.try_connect() {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {
                    return Ok(CycleOutcome::Backoff {
                        attempt: self.retry_count(),
                    })
                }
            }
        }

        match self.drain() {
            Ok(report) => Ok(CycleOutcome::Drained(report)),
            Err(e) => {
                tracing::warn!("Drain failed, dropping database connection: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    /// Reads every persisted reading, oldest first.
    pub fn read_all(&self) -> Result<Vec<Reading>, StorageError> {
        let db = self.db.lock();
        let conn = db.handle.as_ref().ok_or(StorageError::NotConnected)?;
        let mut stmt = conn.prepare(SELECT_ALL_SQL)?;
        let rows = stmt.query_map([], |row| {
            let timestamp: i64 = row.get(0)?;
            let sensor_id: u32 = row.get(1)?;
            let temperature: f64 = row.get(2)?;
            Ok(Reading::at(
                timestamp,
                SensorId(sensor_id),
                temperature as f32,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    /// Closes the connection if open.
    pub fn close(&self) {
        let mut db = self.db.lock();
        if db.handle.take().is_some() {
            db.status = DbStatus::Disconnected;
            tracing::info!("Closed SQL database connection");
        }
    }
}

fn open_database(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(CREATE_TABLE_SQL)?;
    Ok(conn)
}
