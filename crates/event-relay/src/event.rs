use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};

/// Free-form attribute payload attached to an event. Never validated.
pub type Attributes = Map<String, Value>;

/// A single recorded event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Attributes>,
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
    user_id: Option<String>,
}

impl EventRecord {
    pub fn new(
        event_name: impl Into<String>,
        data: Option<Attributes>,
        timestamp: u64,
        user_id: Option<String>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            timestamp,
            user_id,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn data(&self) -> Option<&Attributes> {
        self.data.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// Request body for a single delivery: `{"events": [...]}`.
#[derive(Debug, Serialize)]
pub struct EventBatch<'a> {
    pub events: &'a [EventRecord],
}

/// Hands out enqueue timestamps that never go backwards, even if the wall
/// clock is stepped back.
#[derive(Debug, Default)]
pub(crate) struct EventClock {
    last: u64,
}

impl EventClock {
    pub(crate) fn now(&mut self) -> u64 {
        self.observe(wall_clock_millis())
    }

    fn observe(&mut self, millis: u64) -> u64 {
        self.last = self.last.max(millis);
        self.last
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut data = Attributes::new();
        data.insert("duelId".into(), json!("d-1"));
        let event = EventRecord::new("duel_start", Some(data), 1_700_000_000_000, Some("u-1".into()));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "eventName": "duel_start",
                "data": {"duelId": "d-1"},
                "timestamp": 1_700_000_000_000u64,
                "userId": "u-1",
            })
        );
    }

    #[test]
    fn omits_absent_data_and_keeps_null_user() {
        let event = EventRecord::new("streak_reset", None, 5, None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"eventName": "streak_reset", "timestamp": 5, "userId": null})
        );
    }

    #[test]
    fn batch_wraps_events_in_envelope() {
        let events = vec![
            EventRecord::new("a", None, 1, None),
            EventRecord::new("b", None, 2, None),
        ];
        let value = serde_json::to_value(EventBatch { events: &events }).unwrap();
        let names: Vec<&str> = value["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["eventName"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn clock_never_goes_backwards() {
        let mut clock = EventClock::default();
        assert_eq!(clock.observe(100), 100);
        assert_eq!(clock.observe(90), 100, "backwards step reuses last value");
        assert_eq!(clock.observe(120), 120);
    }

    #[test]
    fn clock_tracks_wall_time() {
        let mut clock = EventClock::default();
        let before = wall_clock_millis();
        let stamp = clock.now();
        assert!(stamp >= before);
    }
}
