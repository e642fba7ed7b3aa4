//! Periodic liveness probe whose cadence slows as more sessions are open.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::ConnectivityError;
use crate::events::{EventBus, HeartbeatEvent};
use crate::service::{EditService, SessionId};

/// Supplies the ids that are active at the moment a probe fires.
pub type ActiveIds = Arc<dyn Fn() -> Vec<SessionId> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatSample {
    pub latency: Duration,
    pub server_uptime: Duration,
    pub server_cpu_load_average: f64,
    pub server_used_memory: u64,
    pub session_count: u64,
    pub server_version: String,
    pub timestamp: OffsetDateTime,
}

/// `base × max(1, active)`.
pub fn interval_for(base: Duration, active: usize) -> Duration {
    let factor = u32::try_from(active.max(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

struct RunningProbe {
    generation: u64,
    interval: Duration,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ProbeSlot {
    generation: u64,
    running: Option<RunningProbe>,
}

pub struct HeartbeatMonitor {
    service: Arc<dyn EditService>,
    events: EventBus,
    base_interval: Duration,
    latest: Arc<RwLock<Option<HeartbeatSample>>>,
    slot: Arc<Mutex<ProbeSlot>>,
}

impl HeartbeatMonitor {
    pub fn new(service: Arc<dyn EditService>, events: EventBus, base_interval: Duration) -> Self {
        Self {
            service,
            events,
            base_interval,
            latest: Arc::new(RwLock::new(None)),
            slot: Arc::new(Mutex::new(ProbeSlot::default())),
        }
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// (Re)starts probing. Any running probe is cancelled first; the new cadence
    /// is derived from how many ids `active_ids` reports right now and the first
    /// probe fires one full interval later.
    pub fn start(&self, active_ids: ActiveIds) {
        let interval = interval_for(self.base_interval, active_ids().len());
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.running.take() {
            previous.handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let probe = Probe {
            service: self.service.clone(),
            events: self.events.clone(),
            latest: self.latest.clone(),
            slot: self.slot.clone(),
            active_ids,
            interval,
            generation,
        };
        let handle = tokio::spawn(probe.run());
        slot.running = Some(RunningProbe {
            generation,
            interval,
            handle,
        });
        debug!(
            target: "reef::heartbeat",
            interval_ms = interval.as_millis() as u64,
            generation,
            "heartbeat scheduled"
        );
    }

    /// Cancels the probe. Safe to call when nothing is running.
    pub fn stop(&self) {
        let stopped = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.running.take()
        };
        if let Some(probe) = stopped {
            probe.handle.abort();
            debug!(target: "reef::heartbeat", "heartbeat stopped");
            self.events.publish(HeartbeatEvent::Stopped);
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().running.is_some()
    }

    pub fn current_interval(&self) -> Option<Duration> {
        self.slot.lock().running.as_ref().map(|probe| probe.interval)
    }

    pub fn latest(&self) -> Option<HeartbeatSample> {
        self.latest.read().clone()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(probe) = self.slot.lock().running.take() {
            probe.handle.abort();
        }
    }
}

struct Probe {
    service: Arc<dyn EditService>,
    events: EventBus,
    latest: Arc<RwLock<Option<HeartbeatSample>>>,
    slot: Arc<Mutex<ProbeSlot>>,
    active_ids: ActiveIds,
    interval: Duration,
    generation: u64,
}

impl Probe {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let interval_ms = self.interval.as_millis() as u64;
        loop {
            ticker.tick().await;
            let ids = (self.active_ids)();
            let sent_at = Instant::now();
            match self.service.heartbeat(&ids, interval_ms).await {
                Ok(response) => {
                    let sample = HeartbeatSample {
                        latency: sent_at.elapsed(),
                        server_uptime: Duration::from_millis(response.uptime_ms),
                        server_cpu_load_average: response.cpu_load_average,
                        server_used_memory: response.used_memory,
                        session_count: response.session_count,
                        server_version: response.version,
                        timestamp: OffsetDateTime::now_utc(),
                    };
                    trace!(
                        target: "reef::heartbeat",
                        latency_ms = sample.latency.as_millis() as u64,
                        sessions = sample.session_count,
                        "heartbeat sample"
                    );
                    *self.latest.write() = Some(sample.clone());
                    self.events.publish(HeartbeatEvent::Tick(sample));
                }
                Err(err) => {
                    let error = Arc::new(ConnectivityError::Heartbeat(err));
                    warn!(
                        target: "reef::heartbeat",
                        error = %error,
                        "heartbeat probe failed; stopping"
                    );
                    self.events.publish(HeartbeatEvent::Failed { error });
                    let mut slot = self.slot.lock();
                    let current = slot
                        .running
                        .as_ref()
                        .is_some_and(|probe| probe.generation == self.generation);
                    if current {
                        slot.running = None;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{HEARTBEAT_TOPIC, ReefEvent};
    use crate::service::ServiceError;
    use crate::service::memory::{MemoryEditService, ServiceOp};

    fn ids(n: usize) -> ActiveIds {
        Arc::new(move || (0..n).map(|i| SessionId::new(format!("s{i}"))).collect())
    }

    #[test]
    fn interval_scales_with_active_sessions() {
        let base = Duration::from_millis(1000);
        assert_eq!(interval_for(base, 0), base);
        assert_eq!(interval_for(base, 1), base);
        assert_eq!(interval_for(base, 3), Duration::from_millis(3000));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn first_sample_arrives_after_one_interval() {
        let service = MemoryEditService::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe(HEARTBEAT_TOPIC);
        let monitor = HeartbeatMonitor::new(service.clone(), bus, Duration::from_millis(1000));

        let started = Instant::now();
        monitor.start(ids(2));
        assert_eq!(monitor.current_interval(), Some(Duration::from_millis(2000)));

        let msg = events.recv().await.unwrap();
        let ReefEvent::Heartbeat(HeartbeatEvent::Tick(sample)) = msg.payload else {
            panic!("expected a heartbeat tick");
        };
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(sample.server_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(monitor.latest(), Some(sample));

        monitor.stop();
        assert!(!monitor.is_running());
        let msg = events.recv().await.unwrap();
        assert!(matches!(
            msg.payload,
            ReefEvent::Heartbeat(HeartbeatEvent::Stopped)
        ));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn probe_failure_stops_the_monitor() {
        let service = MemoryEditService::new();
        service.fail_next(ServiceOp::Heartbeat);
        let bus = EventBus::new();
        let mut events = bus.subscribe(HEARTBEAT_TOPIC);
        let monitor = HeartbeatMonitor::new(service.clone(), bus, Duration::from_millis(500));

        monitor.start(ids(1));
        let msg = events.recv().await.unwrap();
        assert!(matches!(
            msg.payload,
            ReefEvent::Heartbeat(HeartbeatEvent::Failed { ref error })
                if matches!(**error, ConnectivityError::Heartbeat(ServiceError::Transport(_)))
        ));
        assert!(!monitor.is_running());
        assert_eq!(monitor.latest(), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(service.call_count(ServiceOp::Heartbeat), 1);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let service = MemoryEditService::new();
        let monitor = HeartbeatMonitor::new(service, EventBus::new(), Duration::from_secs(1));
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
        assert_eq!(monitor.current_interval(), None);
    }
}
