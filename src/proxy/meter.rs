//! Request metering: rate-limit admission on the hot path, accounting off it.
//!
//! Admission consults the persisted per-(user, service, UTC-day) counter in
//! one atomic statement. Accounting enqueues a stat row into a bounded
//! in-memory queue drained by a background task; when the queue is full the
//! oldest row is dropped. Telemetry is best-effort and never blocks or
//! fails a request.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::db::{utc_day, MainStore, ProxyRequestStat, ServiceRecord};
use crate::proxy::error::{ProxyError, ProxyResult};

pub struct RequestMeter {
    store: Arc<RwLock<MainStore>>,
    queue: Mutex<VecDeque<ProxyRequestStat>>,
    notify: Notify,
    capacity: usize,
}

impl RequestMeter {
    pub fn new(store: Arc<RwLock<MainStore>>, capacity: usize) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rate-limit admission for one request. `rpd_limit == 0` always admits.
    /// A denied request leaves the persisted counter unchanged.
    pub fn admit(&self, record: &ServiceRecord, user_id: i64) -> ProxyResult<()> {
        if record.rpd_limit <= 0 {
            return Ok(());
        }
        let day = utc_day(Utc::now());
        let store = self
            .store
            .read()
            .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))?;
        let admitted = store
            .admit_request(user_id, record.id, record.rpd_limit, &day)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        if admitted {
            Ok(())
        } else {
            Err(ProxyError::RateLimited(record.name.clone()))
        }
    }

    /// Enqueues one accounting row. Never blocks; drops the oldest row when
    /// the queue is full.
    pub fn record(&self, stat: ProxyRequestStat) {
        {
            let mut queue = self.queue.lock().expect("stat queue lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                log::debug!("Stat queue full, dropping oldest entry");
            }
            queue.push_back(stat);
        }
        self.notify.notify_one();
    }

    /// Number of queued, not-yet-persisted rows.
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("stat queue lock").len()
    }

    fn drain_batch(&self) -> Vec<ProxyRequestStat> {
        let mut queue = self.queue.lock().expect("stat queue lock");
        queue.drain(..).collect()
    }

    fn flush(&self) {
        let batch = self.drain_batch();
        if batch.is_empty() {
            return;
        }
        let store = match self.store.read() {
            Ok(store) => store,
            Err(e) => {
                log::error!("Stat drainer lost the store lock: {}", e);
                return;
            }
        };
        for stat in &batch {
            if let Err(e) = store.record_request_stat(stat) {
                // Best-effort: log and move on, never fail the drainer.
                log::warn!("Failed to persist request stat: {}", e);
            }
        }
    }

    /// Runs the background drainer until cancellation, then flushes once
    /// more so shutdown does not lose queued rows.
    pub async fn run_drainer(self: Arc<Self>, ct: CancellationToken) {
        log::info!("Request stat drainer started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    // Let a small batch accumulate before hitting the store.
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    self.flush();
                }
                _ = ct.cancelled() => {
                    self.flush();
                    log::info!("Request stat drainer stopped");
                    return;
                }
            }
        }
    }
}
