use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Process-wide counters for the binding runtime.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    mqtt_messages_received: AtomicU64,
    mqtt_trigger_inflight: AtomicU64,
    mqtt_trigger_failures: AtomicU64,
    mqtt_publish_success: AtomicU64,
    mqtt_publish_failure: AtomicU64,
    mqtt_disconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub mqtt_messages_received: u64,
    pub mqtt_trigger_inflight: u64,
    pub mqtt_trigger_failures: u64,
    pub mqtt_publish_success: u64,
    pub mqtt_publish_failure: u64,
    pub mqtt_disconnects: u64,
}

impl RuntimeCounters {
    pub fn inc_mqtt_messages_received(&self) {
        self.mqtt_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mqtt_trigger_inflight(&self) {
        self.mqtt_trigger_inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_mqtt_trigger_inflight(&self) {
        let _ = self
            .mqtt_trigger_inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
    }

    /// Counts one trigger execution as inflight until the guard drops, including on
    /// unwind.
    pub fn track_mqtt_trigger(&self) -> InflightGuard<'_> {
        self.inc_mqtt_trigger_inflight();
        InflightGuard { counters: self }
    }

    pub fn inc_mqtt_trigger_failures(&self) {
        self.mqtt_trigger_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mqtt_publish_success(&self) {
        self.mqtt_publish_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mqtt_publish_failure(&self) {
        self.mqtt_publish_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mqtt_disconnects(&self) {
        self.mqtt_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            mqtt_messages_received: self.mqtt_messages_received.load(Ordering::Relaxed),
            mqtt_trigger_inflight: self.mqtt_trigger_inflight.load(Ordering::Relaxed),
            mqtt_trigger_failures: self.mqtt_trigger_failures.load(Ordering::Relaxed),
            mqtt_publish_success: self.mqtt_publish_success.load(Ordering::Relaxed),
            mqtt_publish_failure: self.mqtt_publish_failure.load(Ordering::Relaxed),
            mqtt_disconnects: self.mqtt_disconnects.load(Ordering::Relaxed),
        }
    }
}

pub struct InflightGuard<'a> {
    counters: &'a RuntimeCounters,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.counters.dec_mqtt_trigger_inflight();
    }
}

pub fn metrics() -> &'static RuntimeCounters {
    static INSTANCE: OnceLock<RuntimeCounters> = OnceLock::new();
    INSTANCE.get_or_init(RuntimeCounters::default)
}
