//! Background health monitor.
//!
//! One task pings the global instance of every service each cycle with a
//! short deadline and records the status transition in the store. The
//! monitor never creates instances; after the failure threshold it closes
//! the broken instance and purges its handlers so the next request (or the
//! resync task) rebuilds from scratch.
//!
//! Per-service state machine:
//! `unknown -> starting -> healthy <-> warning -> unhealthy -> (rebuild) -> ...`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::{HealthStatus, ServiceRecord};
use crate::proxy::cache::global_key;
use crate::state::AppState;

#[derive(Default, Clone, Copy)]
struct FailureTrack {
    consecutive_failures: u32,
    last_status: Option<HealthStatus>,
}

pub struct HealthMonitor {
    state: Arc<AppState>,
    tracks: Mutex<HashMap<i64, FailureTrack>>,
}

impl HealthMonitor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs cycles until cancellation.
    pub async fn run(self: Arc<Self>, ct: CancellationToken) {
        log::info!(
            "Health monitor started, interval {}s",
            self.state.settings.health_interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.state.settings.health_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_cycle().await,
                _ = ct.cancelled() => {
                    log::info!("Health monitor stopped");
                    return;
                }
            }
        }
    }

    /// One observation pass over all non-deleted services.
    pub async fn run_cycle(&self) {
        let services = {
            let store = match self.state.store.read() {
                Ok(store) => store,
                Err(e) => {
                    log::error!("Health monitor lost the store lock: {}", e);
                    return;
                }
            };
            match store.list_services() {
                Ok(services) => services,
                Err(e) => {
                    log::error!("Health monitor failed to list services: {}", e);
                    return;
                }
            }
        };

        for record in services {
            let (status, details) = self.observe(&record).await;
            self.transition(&record, status, details);
        }
    }

    /// Classifies one service without creating anything.
    async fn observe(&self, record: &ServiceRecord) -> (HealthStatus, Option<String>) {
        if !record.enabled {
            self.reset_track(record.id);
            return (HealthStatus::Stopped, None);
        }

        let key = global_key(record.id);
        let instance = match self.state.instances.get(&key) {
            Some(instance) => instance,
            None => {
                if self.state.instances.is_building(&key) {
                    return (HealthStatus::Starting, None);
                }
                // A broken instance was torn down; stay unhealthy until a
                // rebuilt one answers a ping.
                let track = self.track(record.id);
                if track.consecutive_failures >= self.state.settings.health_fail_threshold {
                    return (
                        HealthStatus::Unhealthy,
                        Some(format!(
                            "{} consecutive ping failures, waiting for rebuild",
                            track.consecutive_failures
                        )),
                    );
                }
                return (HealthStatus::Stopped, None);
            }
        };

        if !instance.is_ready() {
            return (HealthStatus::Starting, None);
        }

        let started = Instant::now();
        match instance.ping(self.state.settings.health_ping_timeout).await {
            Ok(()) => {
                self.reset_track(record.id);
                let caps = instance.capabilities();
                (
                    HealthStatus::Healthy,
                    Some(format!(
                        "ping ok in {}ms, {} tools",
                        started.elapsed().as_millis(),
                        caps.tools
                    )),
                )
            }
            Err(e) => {
                let failures = self.bump_track(record.id);
                let details = format!("{} consecutive ping failures: {}", failures, e);
                if failures >= self.state.settings.health_fail_threshold {
                    // The transport is gone; close it so the next request
                    // rebuilds instead of hitting a dead backend.
                    if let Some(broken) = self.state.instances.invalidate(&key) {
                        self.state.handlers.purge_key(&key);
                        if let Err(e) = broken.shutdown().await {
                            log::warn!("Shutdown of {} failed: {}", key, e);
                        }
                    }
                    (HealthStatus::Unhealthy, Some(details))
                } else {
                    (HealthStatus::Warning, Some(details))
                }
            }
        }
    }

    /// Persists the observation and logs transitions.
    fn transition(&self, record: &ServiceRecord, status: HealthStatus, details: Option<String>) {
        let previous = {
            let mut tracks = self.tracks.lock().expect("health tracks lock");
            let track = tracks.entry(record.id).or_default();
            let previous = track.last_status;
            track.last_status = Some(status);
            previous
        };

        if previous != Some(status) {
            match status {
                HealthStatus::Unhealthy => log::warn!(
                    "Service {} transitioned {} -> unhealthy: {}",
                    record.name,
                    previous.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()),
                    details.as_deref().unwrap_or("")
                ),
                _ => log::info!(
                    "Service {} transitioned {} -> {}",
                    record.name,
                    previous.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()),
                    status
                ),
            }
        }

        if let Ok(store) = self.state.store.read() {
            if let Err(e) = store.update_service_health(record.id, status, details.as_deref()) {
                log::warn!("Failed to persist health of {}: {}", record.name, e);
            }
        }
    }

    fn track(&self, service_id: i64) -> FailureTrack {
        *self
            .tracks
            .lock()
            .expect("health tracks lock")
            .entry(service_id)
            .or_default()
    }

    fn bump_track(&self, service_id: i64) -> u32 {
        let mut tracks = self.tracks.lock().expect("health tracks lock");
        let track = tracks.entry(service_id).or_default();
        track.consecutive_failures += 1;
        track.consecutive_failures
    }

    fn reset_track(&self, service_id: i64) {
        let mut tracks = self.tracks.lock().expect("health tracks lock");
        tracks.entry(service_id).or_default().consecutive_failures = 0;
    }
}
