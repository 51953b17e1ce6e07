//! Periodic status polling and heartbeats.
//!
//! A single task sends a `DP_QUERY` every status interval and a `HEART_BEAT`
//! in between so the device keeps the session open. Past a threshold of
//! consecutive failures both intervals back off exponentially and the device
//! is marked unavailable until a round trip succeeds again.

use crate::config::Timing;
use crate::dispatcher::CommandDispatcher;
use crate::error::TuyaError;
use crate::protocol::CommandType;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct PollStatus {
    available: AtomicBool,
    consecutive_failures: AtomicU32,
}

/// Handle to the polling task.
#[derive(Clone)]
pub struct PollingScheduler {
    status: Arc<PollStatus>,
    refresh: Arc<Notify>,
    cancel_token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PollingScheduler {
    /// Starts polling through `dispatcher`. The first status query goes out immediately.
    pub fn spawn(
        dispatcher: CommandDispatcher,
        timing: &Timing,
        cancel_token: CancellationToken,
    ) -> Self {
        let status = Arc::new(PollStatus::default());
        let refresh = Arc::new(Notify::new());

        let poller = Poller {
            dispatcher,
            status_interval: timing.status_interval,
            heartbeat_interval: timing.heartbeat_interval,
            max_interval: timing.max_poll_interval,
            threshold: timing.poll_failure_threshold,
            status: status.clone(),
            refresh: refresh.clone(),
            cancel_token: cancel_token.clone(),
        };
        let handle = tokio::spawn(poller.run());

        Self {
            status,
            refresh,
            cancel_token,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Schedules a status query as soon as possible (used after control commands).
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// False until the first successful poll and after repeated poll failures.
    pub fn is_available(&self) -> bool {
        self.status.available.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.status.consecutive_failures.load(Ordering::Acquire)
    }

    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Poller {
    dispatcher: CommandDispatcher,
    status_interval: Duration,
    heartbeat_interval: Duration,
    max_interval: Duration,
    threshold: u32,
    status: Arc<PollStatus>,
    refresh: Arc<Notify>,
    cancel_token: CancellationToken,
}

impl Poller {
    async fn run(self) {
        let device_id = self.dispatcher.device_id().to_string();
        debug!("Polling started for device {}", device_id);

        let mut next_status = Instant::now();
        let mut next_heartbeat = next_status + self.heartbeat_interval;

        loop {
            let wake = next_status.min(next_heartbeat);
            let refreshed = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = self.refresh.notified() => true,
                _ = sleep_until(wake) => false,
            };

            let now = Instant::now();
            let command = if refreshed || now >= next_status {
                CommandType::DpQuery
            } else {
                CommandType::HeartBeat
            };

            let result = self.dispatcher.send_command(command, None).await;
            if matches!(result, Err(TuyaError::Cancelled)) && self.cancel_token.is_cancelled() {
                break;
            }

            let failures = match result {
                Ok(_) => self.record_success(&device_id),
                Err(e) => self.record_failure(&device_id, command, e),
            };

            let now = Instant::now();
            if command == CommandType::DpQuery {
                next_status = now + self.interval(self.status_interval, failures);
            }
            next_heartbeat = now + self.interval(self.heartbeat_interval, failures);
        }

        debug!("Polling stopped for device {}", device_id);
    }

    fn interval(&self, base: Duration, failures: u32) -> Duration {
        effective_interval(base, self.max_interval, failures, self.threshold)
    }

    fn record_success(&self, device_id: &str) -> u32 {
        self.status.consecutive_failures.store(0, Ordering::Release);
        if !self.status.available.swap(true, Ordering::AcqRel) {
            info!("Device {} is available", device_id);
        }
        0
    }

    fn record_failure(&self, device_id: &str, command: CommandType, e: TuyaError) -> u32 {
        let failures = self.status.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "{:?} to device {} failed ({} in a row): {}",
            command, device_id, failures, e
        );
        if failures >= self.threshold && self.status.available.swap(false, Ordering::AcqRel) {
            warn!(
                "Device {} unavailable after {} failed polls",
                device_id, failures
            );
        }
        failures
    }
}

/// Poll interval after `failures` consecutive failures: doubles from the
/// threshold on, capped at `max` (never below `base`).
pub fn effective_interval(base: Duration, max: Duration, failures: u32, threshold: u32) -> Duration {
    if failures < threshold {
        return base;
    }
    let exp = (failures - threshold + 1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(max.max(base))
}
