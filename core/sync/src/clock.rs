//! Time and replica identity.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time and of this replica's identifier.
///
/// The device id tags remote writes for diagnostics; it plays no part in
/// conflict decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn device_id(&self) -> &str;
}

/// Wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    device_id: String,
}

impl SystemClock {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    /// Clock with a freshly generated device id.
    pub fn generated() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::generated()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    device_id: String,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>, device_id: impl Into<String>) -> Self {
        Self {
            now: Mutex::new(now),
            device_id: device_id.into(),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start, "laptop");
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(3));
        assert_eq!(clock.now(), start + Duration::minutes(3));
        assert_eq!(clock.device_id(), "laptop");
    }

    #[test]
    fn test_generated_device_ids_differ() {
        assert_ne!(SystemClock::generated().device_id(), SystemClock::generated().device_id());
    }
}
