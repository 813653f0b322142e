//! Multi-device clocks with skew and drift.
//!
//! Each registered device reports an apparent time derived from the
//! reference clock:
//!
//! ```text
//! apparent = base + (now - base) * (1 + drift_rate_per_second) + skew
//! ```
//!
//! Synchronizing to a master adjusts every other device's skew so that
//! apparent times agree at that instant. Drift keeps running afterwards and
//! is not corrected until the next sync.
//!
//! The synchronizer owns no clock; callers pass the reference instant. This
//! keeps the math pure and lets the orchestrator decide which scheduler
//! supplies "now".

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::scale;

/// A simulated device clock.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceClock {
    pub device_id: String,
    /// Reference instant at registration.
    pub base_instant: DateTime<Utc>,
    /// Fixed offset from the reference clock. Negative means behind.
    pub skew: TimeDelta,
    /// Fractional rate error, e.g. `0.001` gains 1 ms per second.
    pub drift_rate_per_second: f64,
}

impl DeviceClock {
    /// Apparent time of this device when the reference clock reads `now`.
    pub fn apparent_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let elapsed = now - self.base_instant;
        let drifted = scale(elapsed, 1.0 + self.drift_rate_per_second);
        self.base_instant + drifted + self.skew
    }

    /// Offset of this device from the reference clock at `now`.
    pub fn offset(&self, now: DateTime<Utc>) -> TimeDelta {
        self.apparent_time(now) - now
    }
}

/// Registry of named device clocks.
#[derive(Debug, Default)]
pub struct ClockSynchronizer {
    devices: Mutex<BTreeMap<String, DeviceClock>>,
}

impl ClockSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeviceClock>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or re-registers) a device anchored at `now`.
    pub fn register_device(
        &self,
        device_id: impl Into<String>,
        skew: TimeDelta,
        drift_rate_per_second: f64,
        now: DateTime<Utc>,
    ) -> DeviceClock {
        let device = DeviceClock {
            device_id: device_id.into(),
            base_instant: now,
            skew,
            drift_rate_per_second,
        };
        let previous = self
            .lock()
            .insert(device.device_id.clone(), device.clone());
        if previous.is_some() {
            tracing::warn!(device = %device.device_id, "device re-registered, previous clock replaced");
        }
        tracing::debug!(
            device = %device.device_id,
            skew_ms = skew.num_milliseconds(),
            drift = drift_rate_per_second,
            "device registered"
        );
        device
    }

    /// Apparent time of `device_id`; unknown devices report `now`.
    pub fn device_time(&self, device_id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        self.lock()
            .get(device_id)
            .map_or(now, |device| device.apparent_time(now))
    }

    /// Aligns every other device with `master_id` as of `now`.
    ///
    /// An unknown master is treated as reporting `now`. Returns the number
    /// of devices whose skew changed.
    pub fn synchronize_devices(&self, master_id: &str, now: DateTime<Utc>) -> usize {
        let mut devices = self.lock();
        let master_time = devices
            .get(master_id)
            .map_or(now, |master| master.apparent_time(now));

        let mut adjusted = 0;
        for (id, device) in devices.iter_mut() {
            if id == master_id {
                continue;
            }
            let correction = master_time - device.apparent_time(now);
            if correction != TimeDelta::zero() {
                device.skew += correction;
                adjusted += 1;
            }
        }
        tracing::debug!(master = master_id, adjusted, "devices synchronized");
        adjusted
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceClock> {
        self.lock().get(device_id).cloned()
    }

    /// Snapshot of all devices, ordered by id.
    pub fn devices(&self) -> Vec<DeviceClock> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forgets every device.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn skew_without_drift_is_constant_offset() {
        let sync = ClockSynchronizer::new();
        sync.register_device("A", TimeDelta::milliseconds(500), 0.0, t0());

        assert_eq!(sync.device_time("A", t0()) - t0(), TimeDelta::milliseconds(500));
        let later = t0() + TimeDelta::minutes(10);
        assert_eq!(sync.device_time("A", later) - later, TimeDelta::milliseconds(500));
    }

    #[test]
    fn negative_skew_runs_behind() {
        let sync = ClockSynchronizer::new();
        sync.register_device("laggard", TimeDelta::seconds(-2), 0.0, t0());
        assert_eq!(
            sync.device_time("laggard", t0()),
            t0() - TimeDelta::seconds(2)
        );
    }

    #[test]
    fn drift_accumulates_with_elapsed_time() {
        let sync = ClockSynchronizer::new();
        // Gains 1ms per second
        sync.register_device("fast", TimeDelta::zero(), 0.001, t0());

        let later = t0() + TimeDelta::seconds(100);
        assert_eq!(
            sync.device_time("fast", later) - later,
            TimeDelta::milliseconds(100)
        );
    }

    #[test]
    fn unknown_device_falls_back_to_reference() {
        let sync = ClockSynchronizer::new();
        assert_eq!(sync.device_time("ghost", t0()), t0());
    }

    #[test]
    fn synchronize_aligns_all_devices_to_master() {
        let sync = ClockSynchronizer::new();
        sync.register_device("phoneA", TimeDelta::zero(), 0.0, t0());
        sync.register_device("master", TimeDelta::milliseconds(300), 0.0, t0());
        sync.register_device("watch", TimeDelta::milliseconds(-120), 0.0005, t0());

        let now = t0() + TimeDelta::seconds(1);
        let adjusted = sync.synchronize_devices("master", now);
        assert_eq!(adjusted, 2);

        let master_time = sync.device_time("master", now);
        assert_eq!(sync.device_time("phoneA", now), master_time);
        assert_eq!(sync.device_time("watch", now), master_time);
    }

    #[test]
    fn drift_continues_after_sync() {
        let sync = ClockSynchronizer::new();
        sync.register_device("master", TimeDelta::zero(), 0.0, t0());
        sync.register_device("drifty", TimeDelta::zero(), 0.01, t0());

        let sync_at = t0() + TimeDelta::seconds(10);
        sync.synchronize_devices("master", sync_at);
        assert_eq!(sync.device_time("drifty", sync_at), sync.device_time("master", sync_at));

        let later = sync_at + TimeDelta::seconds(10);
        let divergence = sync.device_time("drifty", later) - sync.device_time("master", later);
        assert_eq!(divergence, TimeDelta::milliseconds(100));
    }

    #[test]
    fn reset_clears_devices() {
        let sync = ClockSynchronizer::new();
        sync.register_device("A", TimeDelta::zero(), 0.0, t0());
        sync.register_device("B", TimeDelta::zero(), 0.0, t0());
        assert_eq!(sync.len(), 2);

        sync.reset();
        assert!(sync.is_empty());
        assert!(sync.device("A").is_none());
    }
}
