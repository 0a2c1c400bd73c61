//! Suppression of duplicate state-change notifications.
//!
//! Some semantic events (hotkey tab switches in particular) fire from two
//! independent trigger paths within milliseconds of each other. The deduper
//! keeps a single most-recent marker per emission stream; an identical key
//! inside the window is suppressed, anything else resets the marker.

use std::time::{Duration, Instant};

/// Window inside which a repeated key is considered the same semantic event.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct NotificationDeduper {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl Default for NotificationDeduper {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl NotificationDeduper {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Whether a notification with this key should be emitted now. Emitting
    /// records the key; a suppressed duplicate does not refresh the marker.
    pub fn should_emit(&mut self, key: &str) -> bool {
        self.should_emit_at(key, Instant::now())
    }

    pub fn should_emit_at(&mut self, key: &str, now: Instant) -> bool {
        if let Some((last_key, at)) = &self.last {
            if last_key == key && now.duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((key.to_string(), now));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_keys_inside_window_emit_once() {
        let mut dedup = NotificationDeduper::default();
        let t0 = Instant::now();
        assert!(dedup.should_emit_at("2->3", t0));
        assert!(!dedup.should_emit_at("2->3", t0 + Duration::from_millis(100)));
    }

    #[test]
    fn identical_keys_outside_window_emit_twice() {
        let mut dedup = NotificationDeduper::default();
        let t0 = Instant::now();
        assert!(dedup.should_emit_at("2->3", t0));
        assert!(dedup.should_emit_at("2->3", t0 + Duration::from_millis(600)));
    }

    #[test]
    fn different_keys_are_never_suppressed() {
        let mut dedup = NotificationDeduper::default();
        let t0 = Instant::now();
        assert!(dedup.should_emit_at("2->3", t0));
        assert!(dedup.should_emit_at("3->4", t0 + Duration::from_millis(10)));
        // The marker now tracks the newest key only.
        assert!(dedup.should_emit_at("2->3", t0 + Duration::from_millis(20)));
    }

    #[test]
    fn suppressed_duplicate_does_not_extend_the_window() {
        let mut dedup = NotificationDeduper::default();
        let t0 = Instant::now();
        assert!(dedup.should_emit_at("2->3", t0));
        assert!(!dedup.should_emit_at("2->3", t0 + Duration::from_millis(400)));
        // 600 ms after the original emission, even though only 200 ms after
        // the suppressed duplicate.
        assert!(dedup.should_emit_at("2->3", t0 + Duration::from_millis(600)));
    }
}
